//! Skalene line-oriented text protocol.
//!
//! Every message is a single line:
//!
//! ```text
//! <ascii body>:<decimal crc16>\r\n
//! ```
//!
//! The CRC-16/CCITT covers the body *and* the colon. Bodies are
//! space-separated tokens: the first is the command or response code, and in
//! responses the last one is a status code where `0` means success.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16_ccitt;
use std::fmt;

/// Line terminator.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Separator between body and checksum.
pub const CRC_SEPARATOR: char = ':';

/// Numeric command codes understood by the instrument firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// Write the full device configuration.
    SetConfig,
    /// Read the full device configuration.
    GetConfig,
    /// Start a measurement.
    Start,
    /// Stop a measurement.
    Stop,
    /// Read per-channel results.
    GetResults,
    /// Read one block of raw samples.
    RawBlock,
    /// Reboot into the bootloader.
    BootloaderMode,
    /// Read live channel intensities.
    GetLiveData,
    /// Change the integration time only.
    SetIntegration,
}

impl CommandCode {
    /// Numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::SetConfig => 1,
            Self::GetConfig => 3,
            Self::Start => 5,
            Self::Stop => 7,
            Self::GetResults => 9,
            Self::RawBlock => 11,
            Self::BootloaderMode => 13,
            Self::GetLiveData => 17,
            Self::SetIntegration => 21,
        }
    }

    /// Build a message body from this code and its arguments.
    pub fn body<I, T>(self, args: I) -> String
    where
        I: IntoIterator<Item = T>,
        T: fmt::Display,
    {
        let mut body = self.code().to_string();
        for arg in args {
            body.push(' ');
            body.push_str(&arg.to_string());
        }
        body
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Debug line marker used by current firmware.
pub const DEFAULT_DEBUG_MARKER: &str = "16";

/// Debug line marker used by older firmware revisions.
pub const LEGACY_DEBUG_MARKER: &str = "20";

/// A checksummed text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkaleneMessage {
    body: String,
}

impl SkaleneMessage {
    /// Wrap a body.
    ///
    /// Fails with [`Error::Config`] if the body contains the checksum
    /// separator or a line break, which would not survive the wire.
    pub fn new(body: impl Into<String>) -> Result<Self> {
        let body = body.into();
        if let Some(bad) = body.chars().find(|c| matches!(*c, CRC_SEPARATOR | '\r' | '\n')) {
            return Err(Error::Config(format!(
                "message body {body:?} must not contain {bad:?}"
            )));
        }
        Ok(Self { body })
    }

    /// Get the body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Consume the message, returning the body.
    pub fn into_body(self) -> String {
        self.body
    }

    /// Checksum of this message (`crc16(body + ":")`).
    pub fn crc(&self) -> u16 {
        checksum(&self.body)
    }

    /// Encode for the wire, including the terminator.
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}{CRC_SEPARATOR}{}{LINE_TERMINATOR}",
            self.body,
            self.crc()
        )
        .into_bytes()
    }

    /// Decode one line, checking its checksum.
    ///
    /// A trailing `\r\n` is accepted and ignored.
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.strip_suffix(LINE_TERMINATOR).unwrap_or(line);

        let mut parts = line.split(CRC_SEPARATOR);
        let (Some(body), Some(crc_text), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::MalformedMessage(format!(
                "expected exactly one '{CRC_SEPARATOR}' in {line:?}"
            )));
        };

        let actual: u16 = crc_text.trim().parse().map_err(|_| {
            Error::MalformedMessage(format!("invalid checksum {crc_text:?} in {line:?}"))
        })?;

        let expected = checksum(body);
        if actual != expected {
            return Err(Error::CrcMismatch { expected, actual });
        }

        Ok(Self {
            body: body.to_string(),
        })
    }
}

impl fmt::Display for SkaleneMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body)
    }
}

/// CRC-16/CCITT over `body` followed by the separator.
pub fn checksum(body: &str) -> u16 {
    let mut content = Vec::with_capacity(body.len() + 1);
    content.extend_from_slice(body.as_bytes());
    content.push(CRC_SEPARATOR as u8);
    crc16_ccitt(&content)
}

/// Encode a body as a complete wire line.
pub fn encode(body: &str) -> Result<Vec<u8>> {
    Ok(SkaleneMessage::new(body)?.encode())
}

/// A successful, checksum-verified device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkaleneResponse {
    body: String,
}

impl SkaleneResponse {
    /// Decode a response line and check its status code.
    ///
    /// The last token is the status when it is an integer; any non-zero
    /// status is returned as [`Error::DeviceError`].
    pub fn parse(line: &str) -> Result<Self> {
        let body = SkaleneMessage::decode(line)?.into_body();

        if let Some(code) = body
            .split(' ')
            .next_back()
            .and_then(|token| token.parse::<i64>().ok())
        {
            if code != 0 {
                return Err(Error::DeviceError {
                    code,
                    message: body,
                });
            }
        }

        Ok(Self { body })
    }

    /// Full response body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Consume the response, returning the body.
    pub fn into_body(self) -> String {
        self.body
    }

    /// Space-separated tokens of the body.
    pub fn fields(&self) -> Vec<&str> {
        self.body.split(' ').collect()
    }

    /// First token (the response code).
    pub fn code(&self) -> &str {
        self.body.split(' ').next().unwrap_or_default()
    }
}

impl fmt::Display for SkaleneResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body)
    }
}
