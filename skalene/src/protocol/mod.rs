//! Protocol implementations.

pub mod bootloader;
pub mod crc;
pub mod text;

// Re-export common types
pub use bootloader::{BootloaderCommand, BootloaderFrame, CRC_OKAY_RESPONSE, OKAY_RESPONSE};
pub use text::{CommandCode, SkaleneMessage, SkaleneResponse};
