//! Measurement commands: integration time, start/stop, results, live data
//! and raw queries.

use anyhow::Result;
use console::style;
use log::debug;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, connect, ensure_not_interrupted, was_interrupted};

/// `integration <MS>`
pub(crate) fn cmd_integration(cli: &Cli, config: &Config, millis: u32) -> Result<()> {
    let conn = connect(cli, config)?;
    conn.set_integration(millis)?;
    if !cli.quiet {
        eprintln!(
            "{} Integration time set to {millis} ms",
            style("✓").green()
        );
    }
    Ok(())
}

/// `start`
pub(crate) fn cmd_start(cli: &Cli, config: &Config) -> Result<()> {
    connect(cli, config)?.start()?;
    if !cli.quiet {
        eprintln!("{} Measurement started", style("▶").green());
    }
    Ok(())
}

/// `stop`
pub(crate) fn cmd_stop(cli: &Cli, config: &Config) -> Result<()> {
    connect(cli, config)?.stop()?;
    if !cli.quiet {
        eprintln!("{} Measurement stopped", style("■").green());
    }
    Ok(())
}

/// Table lines for per-channel values.
fn channel_table<T: std::fmt::Display>(values: &[T]) -> Vec<String> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| format!("Channel {}: {v}", i + 1))
        .collect()
}

/// `results`
pub(crate) fn cmd_results(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let results = connect(cli, config)?.get_results()?;
    if json {
        println!("{}", serde_json::to_string(&results)?);
    } else {
        for line in channel_table(&results) {
            println!("{line}");
        }
    }
    Ok(())
}

/// `live`: poll live data until interrupted or `count` readings were taken.
pub(crate) fn cmd_live(
    cli: &Cli,
    config: &Config,
    interval_ms: u64,
    count: Option<u64>,
) -> Result<()> {
    let conn = connect(cli, config)?;
    let interval = Duration::from_millis(interval_ms);

    if !cli.quiet {
        eprintln!("{}", style("Press Ctrl+C to stop").dim());
    }

    let mut taken = 0u64;
    while count.is_none_or(|limit| taken < limit) {
        if was_interrupted() {
            debug!("Live polling interrupted after {taken} readings");
            break;
        }
        let values = conn.get_live_data()?;
        println!("{}", values.join(", "));
        taken += 1;
        thread::sleep(interval);
    }

    Ok(())
}

/// `query <BODY>`: send one text message and print the verified response.
pub(crate) fn cmd_query(cli: &Cli, config: &Config, body: &str) -> Result<()> {
    let conn = connect(cli, config)?;
    ensure_not_interrupted()?;
    let response = conn.query(body)?;
    println!("{}", response.body());
    Ok(())
}
