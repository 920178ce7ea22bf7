//! Firmware flashing through the bootloader.
//!
//! ```text
//! [BOOTLOADER_MODE] -> UNLOCK -> DATA x N -> VERIFY -> SWAP -> done
//!                         |          |          |        |
//!                         +----------+----------+--------+--> failed
//! ```
//!
//! The image is padded with `0xFF` to a whole number of erase blocks and
//! written block by block. The first failure aborts the session; nothing is
//! retried.

use crate::error::{Error, Result};
use crate::protocol::bootloader::BootloaderFrame;
use crate::protocol::crc::crc32;
use crate::protocol::text::CommandCode;
use crate::query::QueryEngine;
use log::{debug, info, warn};
use std::fmt;

/// Flash erase block size in bytes.
pub const ERASE_BLOCK_SIZE: usize = 16384;

/// Default program flash address.
pub const DEFAULT_FLASH_ADDRESS: u32 = 0x9D10_0000;

/// Byte used to pad the image to a whole erase block.
pub const PAD_BYTE: u8 = 0xFF;

/// Stage of a flashing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStage {
    /// Asking the application firmware to reboot into the bootloader.
    EnteringBootloader,
    /// Unlocking the target range.
    Unlocking,
    /// Writing erase blocks.
    Programming,
    /// Checking the image CRC.
    Verifying,
    /// Swapping flash banks.
    Swapping,
    /// Finished successfully.
    Done,
    /// Aborted.
    Failed,
}

impl FlashStage {
    /// Whether the device flash may have been modified by this stage.
    pub fn touches_flash(self) -> bool {
        matches!(self, Self::Programming | Self::Verifying | Self::Swapping)
    }
}

impl fmt::Display for FlashStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EnteringBootloader => "entering bootloader",
            Self::Unlocking => "unlocking",
            Self::Programming => "programming",
            Self::Verifying => "verifying",
            Self::Swapping => "swapping banks",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Flashing options.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Target flash address.
    pub address: u32,
    /// Erase block size.
    pub erase_size: usize,
    /// Send BOOTLOADER_MODE first. Disable when the device already runs its
    /// bootloader.
    pub enter_bootloader: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_FLASH_ADDRESS,
            erase_size: ERASE_BLOCK_SIZE,
            enter_bootloader: true,
        }
    }
}

/// One flashing run over a padded image.
#[derive(Debug)]
pub struct FlashSession {
    image: Vec<u8>,
    address: u32,
    erase_size: usize,
    enter_bootloader: bool,
    stage: FlashStage,
}

impl FlashSession {
    /// Pad `image` and check that it fits at the target address.
    pub fn new(image: &[u8], options: &FlashOptions) -> Result<Self> {
        if image.is_empty() {
            return Err(Error::Config("firmware image is empty".into()));
        }
        if options.erase_size == 0 {
            return Err(Error::Config("erase block size must be non-zero".into()));
        }

        let padded_len = image.len().div_ceil(options.erase_size) * options.erase_size;
        let fits = u32::try_from(padded_len)
            .ok()
            .and_then(|len| options.address.checked_add(len));
        if fits.is_none() {
            return Err(Error::Config(format!(
                "image of {padded_len} bytes does not fit at 0x{:08X}",
                options.address
            )));
        }

        let mut padded = image.to_vec();
        padded.resize(padded_len, PAD_BYTE);
        debug!(
            "Padded image from {} to {padded_len} bytes",
            image.len()
        );

        Ok(Self {
            image: padded,
            address: options.address,
            erase_size: options.erase_size,
            enter_bootloader: options.enter_bootloader,
            stage: if options.enter_bootloader {
                FlashStage::EnteringBootloader
            } else {
                FlashStage::Unlocking
            },
        })
    }

    /// Padded image.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Target address.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Current stage.
    pub fn stage(&self) -> FlashStage {
        self.stage
    }

    /// Number of DATA blocks.
    pub fn block_count(&self) -> usize {
        self.image.len() / self.erase_size
    }

    /// CRC-32 of the padded image.
    pub fn crc(&self) -> u32 {
        crc32(&self.image)
    }

    /// `(address, block)` pairs in programming order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn blocks(&self) -> impl Iterator<Item = (u32, &[u8])> {
        // Safe cast: the padded length was checked to fit in u32
        self.image
            .chunks(self.erase_size)
            .enumerate()
            .map(|(i, block)| (self.address + (i * self.erase_size) as u32, block))
    }

    /// Run every stage, reporting `(stage, current, total)` progress.
    ///
    /// Any failure is returned as [`Error::FlashFailed`] carrying the stage
    /// it happened in.
    pub fn run(
        &mut self,
        engine: &QueryEngine,
        progress: &mut dyn FnMut(FlashStage, usize, usize),
    ) -> Result<()> {
        match self.run_stages(engine, progress) {
            Ok(()) => Ok(()),
            Err(e) => {
                let stage = self.stage;
                warn!("Flashing failed while {stage}: {e}");
                self.stage = FlashStage::Failed;
                progress(FlashStage::Failed, 0, 0);
                Err(Error::FlashFailed {
                    stage,
                    source: Box::new(e),
                })
            },
        }
    }

    fn enter(
        &mut self,
        stage: FlashStage,
        total: usize,
        progress: &mut dyn FnMut(FlashStage, usize, usize),
    ) {
        info!("Flash stage: {stage}");
        self.stage = stage;
        progress(stage, 0, total);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn run_stages(
        &mut self,
        engine: &QueryEngine,
        progress: &mut dyn FnMut(FlashStage, usize, usize),
    ) -> Result<()> {
        if self.enter_bootloader {
            self.enter(FlashStage::EnteringBootloader, 1, progress);
            engine.query(&CommandCode::BootloaderMode.body(std::iter::empty::<u8>()))?;
        }

        self.enter(FlashStage::Unlocking, 1, progress);
        // Safe cast: checked in new()
        let length = self.image.len() as u32;
        engine.query_bootloader(&BootloaderFrame::unlock(self.address, length))?;

        let total = self.block_count();
        self.enter(FlashStage::Programming, total, progress);
        let frames: Vec<BootloaderFrame> = self
            .blocks()
            .map(|(address, block)| BootloaderFrame::data(address, block))
            .collect();
        for (i, frame) in frames.iter().enumerate() {
            engine.query_bootloader(frame)?;
            progress(FlashStage::Programming, i + 1, total);
        }

        let crc = self.crc();
        self.enter(FlashStage::Verifying, 1, progress);
        debug!("Image CRC-32: 0x{crc:08X}");
        engine.query_bootloader(&BootloaderFrame::verify(crc))?;

        self.enter(FlashStage::Swapping, 1, progress);
        engine.query_bootloader(&BootloaderFrame::swap())?;

        self.enter(FlashStage::Done, 0, progress);
        info!("Flashing complete");
        Ok(())
    }
}
