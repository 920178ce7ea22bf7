//! Firmware flash command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use skalene::{DEFAULT_FLASH_ADDRESS, FlashOptions, FlashStage};
use std::path::Path;

use crate::config::Config;
use crate::{
    Cli, CliError, connect, ensure_not_interrupted, parse_hex_u32, set_flashing, use_fancy_output,
};

/// Resolve the flash address: CLI flag, then config file, then the default.
fn resolve_address(cli_address: Option<u32>, config: &Config) -> Result<u32> {
    if let Some(address) = cli_address {
        return Ok(address);
    }
    match config.device.address.as_deref() {
        Some(text) => parse_hex_u32(text)
            .map_err(|e| CliError::Usage(format!("config [device] address: {e}")).into()),
        None => Ok(DEFAULT_FLASH_ADDRESS),
    }
}

/// Create the flash progress bar.
fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    image: &Path,
    address: Option<u32>,
    skip_bootloader_mode: bool,
) -> Result<()> {
    let address = resolve_address(address, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            image.display()
        );
    }
    let data = std::fs::read(image)
        .with_context(|| format!("Failed to read firmware image: {}", image.display()))?;
    if !cli.quiet {
        eprintln!(
            "    {} {} bytes @ 0x{address:08X}",
            style("•").dim(),
            data.len()
        );
    }

    let conn = connect(cli, config)?;
    ensure_not_interrupted()?;

    let options = FlashOptions {
        address,
        enter_bootloader: !skip_bootloader_mode,
        ..FlashOptions::default()
    };

    let pb = progress_bar(cli);
    let mut last_stage = None;
    let result = conn.flash(&data, &options, &mut |stage, current, total| {
        set_flashing(stage.touches_flash());
        if last_stage != Some(stage) {
            last_stage = Some(stage);
            pb.set_message(stage.to_string());
            if !use_fancy_output() && !cli.quiet && stage != FlashStage::Failed {
                eprintln!("{} {stage}", style("→").cyan());
            }
        }
        if total > 0 {
            pb.set_position((current * 100 / total) as u64);
        }
    });
    set_flashing(false);

    if let Err(err) = result {
        pb.abandon_with_message("failed");
        return Err(err.into());
    }
    pb.finish_with_message("complete");

    if !cli.quiet {
        eprintln!(
            "\n{} Flashed {} bytes at 0x{address:08X}",
            style("🎉").green().bold(),
            data.len()
        );
    }

    Ok(())
}
