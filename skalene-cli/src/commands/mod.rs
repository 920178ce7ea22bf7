//! Command implementations.
//!
//! Each subcommand group is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod debug;
pub(crate) mod flash;
pub(crate) mod measure;
pub(crate) mod ports;
pub(crate) mod raw;
pub(crate) mod settings;
