//! # dcas-cli
//!
//! Command-line interface for the DCAS advisory pipeline.
//!
//! ## Commands
//!
//! - `dcas run` - Execute one pipeline run over local product storage
//! - `dcas validate` - Check a settings document and catalog file
//!
//! ## Configuration
//!
//! Settings arrive as a JSON document (see `PipelineSettings`); the SFTP
//! password is taken from `DCAS_SFTP_PASSWORD` so it never appears in shell
//! history.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;

use clap::{Parser, Subcommand, ValueEnum};

/// DCAS CLI - advisory pipeline command-line interface.
#[derive(Debug, Parser)]
#[command(name = "dcas")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log format flag.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    /// JSON structured logs.
    Json,
    /// Pretty-printed logs.
    Pretty,
}

impl From<LogFormatArg> for dcas_core::observability::LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Json => Self::Json,
            LogFormatArg::Pretty => Self::Pretty,
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute one pipeline run.
    Run(commands::run::RunArgs),
    /// Validate a settings document and catalog file.
    Validate(commands::validate::ValidateArgs),
}
