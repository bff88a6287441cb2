//! Validate command - check settings and catalogs without running.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use dcas_core::catalog::RunCatalogs;
use dcas_core::config::PipelineSettings;

/// Arguments for the validate command.
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path to the settings JSON document.
    #[arg(long)]
    pub settings: PathBuf,

    /// Path to the catalogs JSON document.
    #[arg(long)]
    pub catalogs: Option<PathBuf>,
}

/// Execute the validate command.
///
/// # Errors
///
/// Returns an error when a file cannot be read or fails validation.
pub fn execute(args: &ValidateArgs) -> Result<()> {
    let settings_json = std::fs::read_to_string(&args.settings)
        .with_context(|| format!("failed to read settings {}", args.settings.display()))?;
    let settings = PipelineSettings::from_json(&settings_json)?;
    println!("settings: ok");
    println!("  farm_num_partitions:      {}", settings.farm_num_partitions);
    println!(
        "  grid_crop_num_partitions: {}",
        settings.grid_crop_num_partitions
    );
    println!("  registries:               {}", settings.farm_registries.len());

    if let Some(path) = &args.catalogs {
        let catalogs_json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalogs {}", path.display()))?;
        let catalogs: RunCatalogs =
            serde_json::from_str(&catalogs_json).context("failed to parse catalogs")?;
        println!("catalogs: ok");
        println!("  crops:      {}", catalogs.crops.len());
        println!("  rules:      {}", catalogs.rules.len());
        println!("  gdd matrix: {}", catalogs.gdd_matrix.len());
        println!("  templates:  {}", catalogs.templates.len());
        println!("  countries:  {}", catalogs.country_configs.len());
    }
    Ok(())
}
