//! Error types for skalene.

use crate::config::ConfigErrors;
use crate::flasher::FlashStage;
use crate::protocol::bootloader::BootloaderCommand;
use std::io;
use thiserror::Error;

/// Result type for skalene operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for skalene operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The transport closed while the engine was still reading from it.
    #[error("Stream closed")]
    StreamClosed,

    /// Text message checksum mismatch.
    #[error("CRC mismatch: expected {expected}, got {actual}")]
    CrcMismatch {
        /// CRC recomputed over the received body.
        expected: u16,
        /// CRC carried by the message.
        actual: u16,
    },

    /// A text line that cannot be split into body and checksum.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The device answered a text query with a non-zero status code.
    #[error("Device reported error code {code}: {message}")]
    DeviceError {
        /// Status code (last token of the response).
        code: i64,
        /// Full response body.
        message: String,
    },

    /// The bootloader answered with an unexpected response byte.
    #[error("Unexpected response to {command}: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedResponse {
        /// Command that was sent.
        command: BootloaderCommand,
        /// Response code required to continue.
        expected: u8,
        /// Response code received.
        actual: u8,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A second query tried to wait on a sub-stream that already has one.
    #[error("Another query is already waiting on this stream")]
    QueryInFlight,

    /// Device configuration failed validation.
    #[error("Invalid device configuration: {0}")]
    InvalidConfig(ConfigErrors),

    /// Firmware flashing aborted.
    #[error("Flashing failed while {stage}: {source}")]
    FlashFailed {
        /// Stage that failed.
        stage: FlashStage,
        /// Underlying failure.
        source: Box<Error>,
    },

    /// The connection saw a fatal error earlier and must be reopened.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No response before the deadline.
    Timeout,
    /// Checksum mismatch or unparsable message.
    Integrity,
    /// Device-reported failure or unexpected response code.
    Protocol,
    /// The transport failed or closed.
    Transport,
    /// The connection can no longer be trusted.
    Fatal,
    /// Caller supplied invalid input.
    Usage,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::CrcMismatch { .. } | Self::MalformedMessage(_) => ErrorKind::Integrity,
            Self::DeviceError { .. } | Self::UnexpectedResponse { .. } | Self::Protocol(_) => {
                ErrorKind::Protocol
            },
            Self::Io(_) | Self::StreamClosed => ErrorKind::Transport,
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorKind::Transport,
            Self::FlashFailed { stage, source } => {
                if stage.touches_flash() {
                    ErrorKind::Fatal
                } else {
                    source.kind()
                }
            },
            Self::ConnectionLost(_) => ErrorKind::Fatal,
            Self::QueryInFlight | Self::InvalidConfig(_) | Self::Config(_) => ErrorKind::Usage,
        }
    }

    /// Whether the connection must be reopened after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal | ErrorKind::Transport)
    }

    /// Device or bootloader response code carried by this error, if any.
    pub fn response_code(&self) -> Option<i64> {
        match self {
            Self::DeviceError { code, .. } => Some(*code),
            Self::UnexpectedResponse { actual, .. } => Some(i64::from(*actual)),
            Self::FlashFailed { source, .. } => source.response_code(),
            _ => None,
        }
    }
}
