//! DCAS CLI - entry point for the `dcas` binary.

use anyhow::Result;
use clap::Parser;

use dcas_cli::{Cli, Commands};
use dcas_core::observability::init_logging;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format.into());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => dcas_cli::commands::run::execute(args).await,
            Commands::Validate(args) => dcas_cli::commands::validate::execute(&args),
        }
    })
}
