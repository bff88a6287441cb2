//! Run command - execute one pipeline run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use dcas_core::catalog::RunCatalogs;
use dcas_core::config::PipelineSettings;
use dcas_core::storage::LocalFsBackend;
use dcas_pipeline::output::SftpConfig;
use dcas_pipeline::{CancelToken, DcasPipeline, PipelineEnv};

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Root directory of the product storage.
    #[arg(long)]
    pub products_root: PathBuf,

    /// Path to the settings JSON document.
    #[arg(long)]
    pub settings: PathBuf,

    /// Path to the catalogs JSON document.
    #[arg(long)]
    pub catalogs: PathBuf,

    /// Object key of the wide weather snapshot, relative to the root.
    #[arg(long, default_value = "inputs/weather.parquet")]
    pub weather: String,

    /// Per-stage deadline in seconds.
    #[arg(long)]
    pub stage_timeout_secs: Option<u64>,

    /// SFTP endpoint as host:port, when SFTP delivery is enabled.
    #[arg(long, env = "DCAS_SFTP_HOST")]
    pub sftp_host: Option<String>,

    /// SFTP login user.
    #[arg(long, env = "DCAS_SFTP_USER")]
    pub sftp_user: Option<String>,

    /// SFTP login password.
    #[arg(long, env = "DCAS_SFTP_PASSWORD", hide_env_values = true)]
    pub sftp_password: Option<String>,

    /// Remote directory the CSV lands in.
    #[arg(long, env = "DCAS_SFTP_REMOTE_PATH", default_value = "/upload")]
    pub sftp_remote_path: String,
}

/// Execute the run command.
///
/// # Errors
///
/// Returns an error when an input file cannot be read, the settings are
/// invalid, or the run fails.
pub async fn execute(args: RunArgs) -> Result<()> {
    let settings_json = std::fs::read_to_string(&args.settings)
        .with_context(|| format!("failed to read settings {}", args.settings.display()))?;
    let settings = PipelineSettings::from_json(&settings_json)?;

    let catalogs_json = std::fs::read_to_string(&args.catalogs)
        .with_context(|| format!("failed to read catalogs {}", args.catalogs.display()))?;
    let catalogs: RunCatalogs =
        serde_json::from_str(&catalogs_json).context("failed to parse catalogs")?;

    let sftp = match (&args.sftp_host, &args.sftp_user, &args.sftp_password) {
        (Some(host), Some(user), Some(password)) => Some(SftpConfig {
            host: host.clone(),
            username: user.clone(),
            password: password.clone(),
            remote_path: args.sftp_remote_path.clone(),
        }),
        _ => None,
    };

    let env = PipelineEnv {
        backend: Arc::new(LocalFsBackend::new(&args.products_root)),
        catalogs: Arc::new(catalogs),
        settings,
        weather_path: args.weather.clone(),
        products_root: Some(args.products_root.clone()),
        sftp,
        stage_timeout: args.stage_timeout_secs.map(Duration::from_secs),
    };

    let pipeline = DcasPipeline::new(env);
    let cancel = CancelToken::new();
    let summary = pipeline.run(&cancel).await?;

    println!("Run {} finished: {}", summary.request_id, summary.status);
    println!();
    println!("  Date:       {}", summary.request_date);
    println!("  Rows:       {}", summary.output_rows);
    println!("  Partitions: {}", summary.partitions_written.len());
    println!("  Errors:     {}", summary.error_records);
    if let Some(uri) = &summary.csv_uri {
        println!("  CSV:        {uri}");
    }
    if let Some(remote) = &summary.sftp_path {
        println!("  SFTP:       {remote}");
    }
    for stage in &summary.stages {
        println!(
            "  stage {:<14} {:>8} rows  {:?}",
            stage.stage, stage.rows_processed, stage.status
        );
    }
    Ok(())
}
