//! Shell completion scripts.

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io::Write;

use crate::{Cli, CliError};

/// Pick the requested shell, falling back to the one in `$SHELL`.
fn resolve_shell(requested: Option<Shell>) -> Result<Shell> {
    requested.or_else(Shell::from_env).ok_or_else(|| {
        CliError::Usage("specify a shell type, e.g.: skalene completions bash".to_string()).into()
    })
}

/// Write the completion script for `shell` to `out`.
fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, out);
}

/// `completions [SHELL]`
pub(crate) fn cmd_completions(shell: Option<Shell>) -> Result<()> {
    let shell = resolve_shell(shell)?;
    write_completions(shell, &mut std::io::stdout());
    Ok(())
}
