//! skalene CLI - Command-line tool for Skalene instruments.
//!
//! ## Features
//!
//! - Flash firmware through the instrument bootloader
//! - Read, write and validate the device configuration
//! - Start/stop measurements, read results, live data and raw samples
//! - Follow the device debug log
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::{debug, info};
use skalene::{Connection, ConnectionOptions, NativePortEnumerator, PortEnumerator, SerialConfig};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Set while the device flash is being written.
static FLASHING: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Return [`CliError::Cancelled`] if Ctrl-C was pressed.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

/// Mark the start or end of a flash write.
pub(crate) fn set_flashing(active: bool) {
    FLASHING.store(active, Ordering::Relaxed);
}

/// CLI-level errors with dedicated exit codes.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Invalid invocation.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// skalene - Configure, read and flash Skalene instruments.
///
/// Environment variables:
///   SKALENE_PORT              - Default serial port
///   SKALENE_BAUD              - Default baud rate (default: 115200)
///   SKALENE_DEBUG_MARKER      - Debug line marker (default: 16)
///   SKALENE_NON_INTERACTIVE   - Never guess the serial port
#[derive(Parser)]
#[command(name = "skalene")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "SKALENE_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "SKALENE_BAUD")]
    baud: Option<u32>,

    /// First token of device debug lines [default: 16].
    #[arg(long, global = true, env = "SKALENE_DEBUG_MARKER")]
    debug_marker: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of picking a port).
    #[arg(long, global = true, env = "SKALENE_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware image through the bootloader.
    Flash {
        /// Path to the firmware binary.
        image: PathBuf,

        /// Flash address [default: 0x9D100000].
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Do not send BOOTLOADER_MODE first (device already in bootloader).
        #[arg(long)]
        skip_bootloader_mode: bool,
    },

    /// Read, write or validate the device configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Set the integration time in milliseconds.
    Integration {
        /// Integration time (50-5000 ms).
        millis: u32,
    },

    /// Start a measurement.
    Start,

    /// Stop a measurement.
    Stop,

    /// Read per-channel results.
    Results {
        /// Output results as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Poll live channel readings.
    Live {
        /// Polling interval in milliseconds.
        #[arg(long, default_value = "200")]
        interval: u64,

        /// Stop after this many readings.
        #[arg(long)]
        count: Option<u64>,
    },

    /// Download all raw sample blocks as CSV.
    Raw {
        /// Output CSV file (default: raw_<timestamp>.csv).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print device debug lines until interrupted.
    Debug,

    /// Send a raw text query and print the response.
    Query {
        /// Message body, e.g. "3".
        body: String,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

/// Configuration subcommands.
#[derive(Subcommand)]
enum ConfigAction {
    /// Read the configuration from the device.
    Get {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,

        /// Save the configuration as JSON to a file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a JSON configuration file and write it to the device.
    Set {
        /// JSON configuration file.
        file: PathBuf,
    },

    /// Validate a JSON configuration file without a device.
    Check {
        /// JSON configuration file.
        file: PathBuf,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x9D10_0000
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Serial port from CLI/env, config file, or the only USB port present.
fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(port) = cli.port.clone().or_else(|| config.connection.port.clone()) {
        return Ok(port);
    }

    if cli.non_interactive {
        return Err(CliError::Usage(
            "no serial port given; use --port or SKALENE_PORT".to_string(),
        )
        .into());
    }

    let usb: Vec<_> = NativePortEnumerator::list_ports()?
        .into_iter()
        .filter(|p| p.vid.is_some())
        .collect();
    match usb.as_slice() {
        [only] => {
            info!("Using the only USB serial port found: {}", only.name);
            Ok(only.name.clone())
        },
        [] => Err(CliError::Usage(
            "no serial port given and no USB serial port found; use --port".to_string(),
        )
        .into()),
        _ => Err(CliError::Usage(format!(
            "no serial port given and multiple USB serial ports found ({}); use --port",
            usb.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
        ))
        .into()),
    }
}

/// Open a connection using CLI, env and config file settings.
pub(crate) fn connect(cli: &Cli, config: &Config) -> Result<Connection> {
    let port = get_port(cli, config)?;
    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(skalene::port::DEFAULT_BAUD);
    let marker = cli
        .debug_marker
        .clone()
        .or_else(|| config.device.debug_marker.clone())
        .unwrap_or_else(|| skalene::protocol::text::DEFAULT_DEBUG_MARKER.to_string());

    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            style(&port).cyan(),
            baud
        );
    }

    let conn = Connection::open(
        &SerialConfig::new(&port, baud),
        ConnectionOptions::default().with_debug_marker(marker),
    )
    .with_context(|| format!("Failed to open {port}"))?;
    conn.on_debug(|line| debug!(target: "skalene::device", "{line}"));
    Ok(conn)
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    if let Some(lib_err) = err.downcast_ref::<skalene::Error>() {
        return match lib_err.kind() {
            skalene::ErrorKind::Usage => 2,
            skalene::ErrorKind::Fatal | skalene::ErrorKind::Transport => 3,
            _ => 1,
        };
    }
    1
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if FLASHING.load(Ordering::Relaxed) {
            eprintln!(
                "\n{} Flash write in progress, interrupting now would leave the device unusable",
                style("⚠").yellow()
            );
            return;
        }
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            // Second Ctrl-C: give up waiting for the current query.
            std::process::exit(130);
        }
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            image,
            address,
            skip_bootloader_mode,
        } => commands::flash::cmd_flash(cli, &config, image, *address, *skip_bootloader_mode),
        Commands::Config { action } => match action {
            ConfigAction::Get { json, output } => {
                commands::settings::cmd_config_get(cli, &config, *json, output.as_ref())
            },
            ConfigAction::Set { file } => commands::settings::cmd_config_set(cli, &config, file),
            ConfigAction::Check { file } => commands::settings::cmd_config_check(cli, file),
        },
        Commands::Integration { millis } => {
            commands::measure::cmd_integration(cli, &config, *millis)
        },
        Commands::Start => commands::measure::cmd_start(cli, &config),
        Commands::Stop => commands::measure::cmd_stop(cli, &config),
        Commands::Results { json } => commands::measure::cmd_results(cli, &config, *json),
        Commands::Live { interval, count } => {
            commands::measure::cmd_live(cli, &config, *interval, *count)
        },
        Commands::Raw { output } => commands::raw::cmd_raw(cli, &config, output.as_ref()),
        Commands::Debug => commands::debug::cmd_debug(cli, &config),
        Commands::Query { body } => commands::measure::cmd_query(cli, &config, body),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "skalene v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from(["skalene", "flash", "fw.bin"]).unwrap();
        match cli.command {
            Commands::Flash {
                image,
                address,
                skip_bootloader_mode,
            } => {
                assert_eq!(image, PathBuf::from("fw.bin"));
                assert_eq!(address, None);
                assert!(!skip_bootloader_mode);
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "skalene",
            "flash",
            "fw.bin",
            "--address",
            "0x9D00_0000",
            "--skip-bootloader-mode",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash {
                address,
                skip_bootloader_mode,
                ..
            } => {
                assert_eq!(address, Some(0x9D00_0000));
                assert!(skip_bootloader_mode);
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_parse_config_get() {
        let cli =
            Cli::try_parse_from(["skalene", "config", "get", "--json", "-o", "c.json"]).unwrap();
        match cli.command {
            Commands::Config {
                action: ConfigAction::Get { json, output },
            } => {
                assert!(json);
                assert_eq!(output, Some(PathBuf::from("c.json")));
            },
            _ => panic!("Expected config get"),
        }
    }

    #[test]
    fn test_cli_parse_config_check() {
        let cli = Cli::try_parse_from(["skalene", "config", "check", "c.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Check { .. }
            }
        ));
    }

    #[test]
    fn test_cli_parse_integration() {
        let cli = Cli::try_parse_from(["skalene", "integration", "250"]).unwrap();
        assert!(matches!(cli.command, Commands::Integration { millis: 250 }));
        assert!(Cli::try_parse_from(["skalene", "integration", "fast"]).is_err());
    }

    #[test]
    fn test_cli_parse_live_defaults() {
        let cli = Cli::try_parse_from(["skalene", "live"]).unwrap();
        match cli.command {
            Commands::Live { interval, count } => {
                assert_eq!(interval, 200);
                assert_eq!(count, None);
            },
            _ => panic!("Expected Live command"),
        }
    }

    #[test]
    fn test_cli_parse_query() {
        let cli = Cli::try_parse_from(["skalene", "query", "11 3"]).unwrap();
        match cli.command {
            Commands::Query { body } => assert_eq!(body, "11 3"),
            _ => panic!("Expected Query command"),
        }
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "skalene",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "57600",
            "--debug-marker",
            "20",
            "-vv",
            "--non-interactive",
            "start",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(57600));
        assert_eq!(cli.debug_marker.as_deref(), Some("20"));
        assert_eq!(cli.verbose, 2);
        assert!(cli.non_interactive);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["skalene"]).is_err());
    }

    #[test]
    fn test_parse_hex_u32_with_prefix() {
        assert_eq!(parse_hex_u32("0x9D100000"), Ok(0x9D10_0000));
        assert_eq!(parse_hex_u32("0X9d100000"), Ok(0x9D10_0000));
    }

    #[test]
    fn test_parse_hex_u32_without_prefix() {
        assert_eq!(parse_hex_u32("9D100000"), Ok(0x9D10_0000));
    }

    #[test]
    fn test_parse_hex_u32_with_underscores_and_whitespace() {
        assert_eq!(parse_hex_u32(" 0x9D10_0000 "), Ok(0x9D10_0000));
    }

    #[test]
    fn test_parse_hex_u32_invalid() {
        assert!(parse_hex_u32("0xGG").is_err());
        assert!(parse_hex_u32("0x1_0000_0000").is_err());
    }

    #[test]
    fn test_exit_codes() {
        let usage: anyhow::Error = CliError::Usage("x".into()).into();
        assert_eq!(exit_code(&usage), 2);

        let cancelled: anyhow::Error = CliError::Cancelled("x".into()).into();
        assert_eq!(exit_code(&cancelled), 130);

        let timeout = anyhow::Error::from(skalene::Error::Timeout("x".into())).context("query");
        assert_eq!(exit_code(&timeout), 1);

        let closed: anyhow::Error = skalene::Error::StreamClosed.into();
        assert_eq!(exit_code(&closed), 3);

        let invalid: anyhow::Error =
            skalene::Error::InvalidConfig(skalene::ConfigErrors::default()).into();
        assert_eq!(exit_code(&invalid), 2);

        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
