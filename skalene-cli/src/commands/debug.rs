//! Device debug log follower.

use anyhow::Result;
use console::style;
use std::io::{self, Write as _};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::{Cli, connect, was_interrupted};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Prefix a debug line with a `[seconds.millis]` timestamp.
fn stamp(line: &str, now: Duration) -> String {
    format!("[{}.{:03}] {line}", now.as_secs(), now.subsec_millis())
}

/// `debug`: print debug lines until Ctrl-C or the port closes.
pub(crate) fn cmd_debug(cli: &Cli, config: &Config) -> Result<()> {
    let conn = connect(cli, config)?;
    let timestamps = cli.verbose >= 1;

    if !cli.quiet {
        eprintln!("{}", style("Following debug output, press Ctrl+C to stop").dim());
    }

    conn.on_debug(move |line| {
        let line = if timestamps {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            stamp(line, now)
        } else {
            line.to_string()
        };
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    });

    while !was_interrupted() {
        if conn.streams().debug.is_closed() {
            return Err(skalene::Error::StreamClosed.into());
        }
        thread::sleep(POLL_INTERVAL);
    }

    if !cli.quiet {
        eprintln!("{} Closed", style("👋").cyan());
    }
    Ok(())
}
