//! Serial port abstraction.
//!
//! The engine itself only needs a `Read` half and a `Write` half. This
//! module provides the native serial port that supplies both, plus port
//! enumeration for front ends.
//!
//! ```text
//! +------------------+
//! |    Connection    |
//! +--------+---------+
//!          |  Read + Write
//! +--------+---------+
//! |    Port trait    |
//! +--------+---------+
//!          |
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use serde::Serialize;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default instrument baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default read timeout. Short, so the reader thread notices shutdown.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port configuration.
///
/// Framing is always 8 data bits, no parity, one stop bit and no flow
/// control.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// A byte transport the engine can run on.
pub trait Port: Read + Write + Send {
    /// Discard anything buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;
}

/// Lists available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
