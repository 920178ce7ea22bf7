//! Device configuration commands: get, set and offline check.

use anyhow::{Context, Result};
use console::style;
use skalene::DeviceConfig;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::{Cli, connect};

/// Load and validate a JSON configuration file.
///
/// Validation failures are listed on stderr, one line per field, before the
/// error is returned.
fn load_device_config(path: &Path) -> Result<DeviceConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    match DeviceConfig::from_json_str(&text) {
        Ok(config) => Ok(config),
        Err(skalene::Error::InvalidConfig(errors)) => {
            for (field, message) in errors.iter() {
                eprintln!("  {} {}: {message}", style("✗").red(), style(field).yellow());
            }
            Err(skalene::Error::InvalidConfig(errors))
                .with_context(|| format!("{} is not a valid configuration", path.display()))
        },
        Err(e) => Err(e).with_context(|| format!("Failed to parse {}", path.display())),
    }
}

/// Pretty JSON text of a configuration.
fn to_pretty_json(config: &DeviceConfig) -> Result<String> {
    serde_json::to_string_pretty(&config.to_json()).context("Failed to serialize configuration")
}

/// `config get`
pub(crate) fn cmd_config_get(
    cli: &Cli,
    config: &Config,
    json: bool,
    output: Option<&PathBuf>,
) -> Result<()> {
    let conn = connect(cli, config)?;
    let device_config = conn.get_config()?;

    if let Some(path) = output {
        fs::write(path, to_pretty_json(&device_config)? + "\n")
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} Saved configuration to {}",
                style("✓").green(),
                style(path.display()).yellow()
            );
        }
    }

    if json {
        println!("{}", to_pretty_json(&device_config)?);
    } else if output.is_none() {
        println!("{device_config}");
    }

    Ok(())
}

/// `config set`
pub(crate) fn cmd_config_set(cli: &Cli, config: &Config, file: &Path) -> Result<()> {
    let device_config = load_device_config(file)?;
    let conn = connect(cli, config)?;
    conn.set_config(&device_config)?;

    if !cli.quiet {
        eprintln!("{} Configuration written", style("✓").green());
    }
    Ok(())
}

/// `config check`
pub(crate) fn cmd_config_check(cli: &Cli, file: &Path) -> Result<()> {
    let device_config = load_device_config(file)?;
    if !cli.quiet {
        eprintln!(
            "{} {} is valid",
            style("✓").green(),
            style(file.display()).yellow()
        );
        println!("{device_config}");
    }
    Ok(())
}
