//! Bootloader binary protocol.
//!
//! ## Frame Format
//!
//! ```text
//! +------------+-------------+---------+----------------+
//! |   Magic    | Body length | Command |      Body      |
//! +------------+-------------+---------+----------------+
//! |  4 bytes   |  4 bytes LE | 1 byte  |  length bytes  |
//! +------------+-------------+---------+----------------+
//! | 0x5048434D |             |  0xAx   |                |
//! +------------+-------------+---------+----------------+
//! ```
//!
//! The device answers every frame with a single response byte.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;

/// Frame magic number, written little-endian ("MCHP").
pub const FRAME_MAGIC: u32 = 0x5048434D;

/// Header length: magic + body length + command.
pub const HEADER_LEN: usize = 9;

/// Response: command accepted.
pub const OKAY_RESPONSE: u8 = 0x50;

/// Response: image CRC verified.
pub const CRC_OKAY_RESPONSE: u8 = 0x53;

/// Length of the placeholder body carried by SWAP.
pub const SWAP_BODY_LEN: usize = 16;

/// Bootloader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootloaderCommand {
    /// Unlock a flash range for programming (0xA0).
    Unlock = 0xA0,
    /// Program one erase block (0xA1).
    Data = 0xA1,
    /// Verify the programmed image CRC (0xA2).
    Verify = 0xA2,
    /// Swap flash banks and reboot (0xA4).
    Swap = 0xA4,
}

impl BootloaderCommand {
    /// Response code the device sends on success.
    pub fn expected_response(self) -> u8 {
        match self {
            Self::Verify => CRC_OKAY_RESPONSE,
            _ => OKAY_RESPONSE,
        }
    }
}

impl TryFrom<u8> for BootloaderCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xA0 => Ok(Self::Unlock),
            0xA1 => Ok(Self::Data),
            0xA2 => Ok(Self::Verify),
            0xA4 => Ok(Self::Swap),
            other => Err(Error::Protocol(format!(
                "unknown bootloader command 0x{other:02X}"
            ))),
        }
    }
}

impl fmt::Display for BootloaderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlock => write!(f, "UNLOCK"),
            Self::Data => write!(f, "DATA"),
            Self::Verify => write!(f, "VERIFY"),
            Self::Swap => write!(f, "SWAP"),
        }
    }
}

/// Bootloader request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderFrame {
    command: BootloaderCommand,
    body: Vec<u8>,
}

impl BootloaderFrame {
    /// Create a frame with an arbitrary body.
    pub fn new(command: BootloaderCommand, body: Vec<u8>) -> Self {
        Self { command, body }
    }

    /// Build an UNLOCK frame for `length` bytes starting at `address`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn unlock(address: u32, length: u32) -> Self {
        let mut body = Vec::with_capacity(8);
        body.write_u32::<LittleEndian>(address).unwrap();
        body.write_u32::<LittleEndian>(length).unwrap();
        Self::new(BootloaderCommand::Unlock, body)
    }

    /// Build a DATA frame programming `block` at `address`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn data(address: u32, block: &[u8]) -> Self {
        let mut body = Vec::with_capacity(4 + block.len());
        body.write_u32::<LittleEndian>(address).unwrap();
        body.extend_from_slice(block);
        Self::new(BootloaderCommand::Data, body)
    }

    /// Build a VERIFY frame carrying the CRC-32 of the padded image.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn verify(crc: u32) -> Self {
        let mut body = Vec::with_capacity(4);
        body.write_u32::<LittleEndian>(crc).unwrap();
        Self::new(BootloaderCommand::Verify, body)
    }

    /// Build a SWAP frame.
    pub fn swap() -> Self {
        Self::new(BootloaderCommand::Swap, vec![0; SWAP_BODY_LEN])
    }

    /// Get the command.
    pub fn command(&self) -> BootloaderCommand {
        self.command
    }

    /// Get the body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encode the frame for the wire.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.write_u32::<LittleEndian>(FRAME_MAGIC).unwrap();
        // Safe cast: bodies are at most one erase block plus an address
        buf.write_u32::<LittleEndian>(self.body.len() as u32).unwrap();
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parse a complete encoded frame.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let magic = LittleEndian::read_u32(&data[0..4]);
        if magic != FRAME_MAGIC {
            return Err(Error::Protocol(format!("bad frame magic 0x{magic:08X}")));
        }

        let length = LittleEndian::read_u32(&data[4..8]) as usize;
        let body = &data[HEADER_LEN..];
        if body.len() != length {
            return Err(Error::Protocol(format!(
                "frame length field {length} does not match body of {} bytes",
                body.len()
            )));
        }

        Ok(Self::new(BootloaderCommand::try_from(data[8])?, body.to_vec()))
    }
}

/// Interpret a bootloader response chunk.
///
/// Responses are a single byte. Longer chunks are logged and their first byte
/// is used.
pub fn response_code(chunk: &[u8]) -> Result<u8> {
    let Some(&code) = chunk.first() else {
        return Err(Error::Protocol("empty bootloader response".into()));
    };
    if chunk.len() != 1 {
        log::warn!(
            "Bootloader response of unexpected length {}: {:02X?}",
            chunk.len(),
            chunk
        );
    }
    Ok(code)
}
