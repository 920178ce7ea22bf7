//! # skalene
//!
//! Serial transport and protocol engine for the Skalene instrument.
//!
//! The instrument speaks two protocols over one serial link:
//!
//! - a binary bootloader protocol used to flash firmware
//!   ([`protocol::bootloader`])
//! - a checksummed line protocol for configuration and telemetry
//!   ([`protocol::text`])
//!
//! This crate provides:
//!
//! - CRC-32 and CRC-16/CCITT checksums
//! - Frame and line codecs for both protocols
//! - A stream demultiplexer splitting the inbound bytes into raw, debug and
//!   response sub-streams
//! - A FIFO write serializer and single-flight query matching
//! - The UNLOCK / DATA / VERIFY / SWAP flashing sequence
//! - Device configuration validation
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use skalene::{Connection, ConnectionOptions, FlashOptions, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = Connection::open(
//!         &SerialConfig::new("/dev/ttyUSB0", 115200),
//!         ConnectionOptions::default(),
//!     )?;
//!
//!     let image = std::fs::read("firmware.bin")?;
//!     conn.flash(&image, &FlashOptions::default(), &mut |stage, current, total| {
//!         println!("{stage}: {current}/{total}");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod port;
pub mod protocol;
pub mod query;
pub mod stream;
pub mod writer;

#[cfg(test)]
mod mock;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    config::{ConfigErrors, DeviceConfig},
    connection::{Connection, ConnectionOptions, RawData},
    error::{Error, ErrorKind, Result},
    flasher::{DEFAULT_FLASH_ADDRESS, FlashOptions, FlashSession, FlashStage},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        BootloaderCommand, BootloaderFrame, CommandCode, SkaleneMessage, SkaleneResponse,
        crc::{crc16_ccitt, crc32},
    },
    stream::{Demultiplexer, SubStream, SubStreams},
    writer::{WriteSerializer, WriteSlot},
};
