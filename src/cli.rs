//! Pieces shared by the command line programs.
use std::{fmt::Display, path::PathBuf};

use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::logging::{init_logging, LoggingError};

/// Logging options common to all programs.
#[derive(Debug, clap::Args)]
pub struct LoggingCli {
    /// Also write log messages to this file. Messages include the worker
    /// thread name, so concurrent jobs can be told apart.
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

impl LoggingCli {
    pub fn init(&self) -> Result<(), LoggingError> {
        init_logging(self.verbosity.log_level_filter(), self.log_file.as_deref())
    }
}

/// Top-level error for the programs, classified by who is expected to fix it.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The program was called incorrectly
    UsageError(String),

    /// A problem with the dataset configuration, grids, or catalog contents
    InputError(String),

    /// A problem with the system, e.g. a directory that cannot be written
    RuntimeError(String),

    /// Something the user should not be expected to fix
    InternalError(String),
}

impl CliError {
    pub fn usage_error<S: ToString>(msg: S) -> Self {
        Self::UsageError(msg.to_string())
    }

    pub fn input_error<S: ToString>(msg: S) -> Self {
        Self::InputError(msg.to_string())
    }

    pub fn runtime_error<S: ToString>(msg: S) -> Self {
        Self::RuntimeError(msg.to_string())
    }

    pub fn internal_error<S: ToString>(msg: S) -> Self {
        Self::InternalError(msg.to_string())
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (type_str, err_msg, fix_msg) = match self {
            CliError::UsageError(msg) => (
                "Usage error",
                msg,
                "Please check the command line arguments (see --help).",
            ),
            CliError::InputError(msg) => (
                "Input error",
                msg,
                "Please check the dataset configuration, grid files and catalog referenced above.",
            ),
            CliError::RuntimeError(msg) => (
                "Runtime error",
                msg,
                "This may be a temporary or system problem (e.g. file permissions or disk space). Fix it and rerun; completed work will not be repeated.",
            ),
            CliError::InternalError(msg) => (
                "Internal error",
                msg,
                "This is likely a bug. Please report it with the configuration that triggered it.",
            ),
        };

        writeln!(f, "{type_str}: {err_msg}\n\n{fix_msg}")
    }
}
