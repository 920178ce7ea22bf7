//! Raw sample download.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::{Cli, connect, ensure_not_interrupted, use_fancy_output};

/// Default output file name, `raw_<unix seconds>.csv`.
fn default_output_path() -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    PathBuf::from(format!("raw_{secs}.csv"))
}

/// `raw`: read every raw block and save them as CSV.
pub(crate) fn cmd_raw(cli: &Cli, config: &Config, output: Option<&PathBuf>) -> Result<()> {
    let path = output.cloned().unwrap_or_else(default_output_path);
    let conn = connect(cli, config)?;

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(skalene::connection::RAW_BLOCK_COUNT as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let data = conn.read_raw_data(&mut |done, _total| pb.set_position(done as u64))?;
    pb.finish_and_clear();
    ensure_not_interrupted()?;

    write_csv(&path, &data.to_csv())?;
    if !cli.quiet {
        eprintln!(
            "{} Saved {} samples to {}",
            style("✓").green(),
            data.len(),
            style(path.display()).yellow()
        );
    }
    Ok(())
}

fn write_csv(path: &Path, csv: &str) -> Result<()> {
    fs::write(path, csv).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_output_path_shape() {
        let name = default_output_path().display().to_string();
        assert!(name.starts_with("raw_"));
        assert!(name.ends_with(".csv"));
    }

    #[test]
    fn test_write_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let data = skalene::RawData::new(vec!["1".into(), "2".into()]);
        write_csv(&path, &data.to_csv()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Channel 1"));
        assert!(text.contains("1, 2"));
    }
}
