//! Pipeline settings.
//!
//! Settings arrive as a JSON document. Unknown keys are rejected so a typo in
//! an operator-supplied config fails the run loudly instead of silently
//! falling back to a default.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of farm-registry work units.
pub const DEFAULT_FARM_NUM_PARTITIONS: usize = 10;

/// Default number of grid-crop work units.
pub const DEFAULT_GRID_CROP_NUM_PARTITIONS: usize = 5;

/// Columns exported to CSV, in order.
pub const DEFAULT_CSV_COLUMNS: &[&str] = &[
    "farm_unique_id",
    "crop",
    "planting_date",
    "growth_stage",
    "message_code",
    "message_english",
    "message_swahili",
    "message",
    "final_message",
    "timestamp",
    "year",
    "month",
    "day",
];

/// Operator-tunable settings for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    /// Number of work units the farm registry is split into.
    #[serde(default = "default_farm_num_partitions")]
    pub farm_num_partitions: usize,

    /// Number of work units the grid-crop table is split into.
    #[serde(default = "default_grid_crop_num_partitions")]
    pub grid_crop_num_partitions: usize,

    /// Thread budget for the SQL engine used by the CSV export.
    #[serde(default)]
    pub duck_db_num_threads: Option<usize>,

    /// Memory limit for the SQL engine, e.g. "1GB" or "512MB".
    #[serde(default)]
    pub duckdb_memory_limit: Option<String>,

    /// Deliver the exported CSV to the object store.
    #[serde(default)]
    pub store_csv_to_minio: bool,

    /// Deliver the exported CSV over SFTP.
    #[serde(default)]
    pub store_csv_to_sftp: bool,

    /// When set to N, advisory codes already delivered within the last N
    /// weeks are suppressed from the message columns.
    #[serde(default)]
    pub weeks_constraint: Option<u32>,

    /// Overrides the processing date, for backfills and tests.
    #[serde(default)]
    pub override_request_date: Option<NaiveDate>,

    /// Farm registry object keys to process. Empty means all registries.
    #[serde(default)]
    pub farm_registries: Vec<String>,
}

fn default_farm_num_partitions() -> usize {
    DEFAULT_FARM_NUM_PARTITIONS
}

fn default_grid_crop_num_partitions() -> usize {
    DEFAULT_GRID_CROP_NUM_PARTITIONS
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            farm_num_partitions: DEFAULT_FARM_NUM_PARTITIONS,
            grid_crop_num_partitions: DEFAULT_GRID_CROP_NUM_PARTITIONS,
            duck_db_num_threads: None,
            duckdb_memory_limit: None,
            store_csv_to_minio: false,
            store_csv_to_sftp: false,
            weeks_constraint: None,
            override_request_date: None,
            farm_registries: Vec::new(),
        }
    }
}

impl PipelineSettings {
    /// Parses settings from a JSON document.
    ///
    /// # Errors
    /// Returns a configuration error on malformed JSON or unknown keys.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    /// Returns a configuration error for zero partition counts or an
    /// unparseable memory limit.
    pub fn validate(&self) -> Result<()> {
        if self.farm_num_partitions == 0 {
            return Err(Error::Config("farm_num_partitions must be >= 1".into()));
        }
        if self.grid_crop_num_partitions == 0 {
            return Err(Error::Config(
                "grid_crop_num_partitions must be >= 1".into(),
            ));
        }
        if self.weeks_constraint == Some(0) {
            return Err(Error::Config("weeks_constraint must be >= 1".into()));
        }
        if let Some(limit) = &self.duckdb_memory_limit {
            parse_memory_limit(limit)?;
        }
        Ok(())
    }

    /// Returns the processing date: the override when set, otherwise `today`.
    #[must_use]
    pub fn request_date(&self, today: NaiveDate) -> NaiveDate {
        self.override_request_date.unwrap_or(today)
    }

    /// Returns the SQL engine memory limit in bytes, when configured.
    ///
    /// # Errors
    /// Returns a configuration error for an unparseable limit string.
    pub fn memory_limit_bytes(&self) -> Result<Option<u64>> {
        self.duckdb_memory_limit
            .as_deref()
            .map(parse_memory_limit)
            .transpose()
    }
}

/// Parses a human memory-limit string such as "1GB", "512MB" or "4096KB".
///
/// # Errors
/// Returns a configuration error when the string has no recognized unit or
/// a non-numeric magnitude.
pub fn parse_memory_limit(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = upper.strip_suffix("GB") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, 1024)
    } else if let Some(d) = upper.strip_suffix('B') {
        (d, 1)
    } else {
        return Err(Error::Config(format!("unrecognized memory limit: {s}")));
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("unrecognized memory limit: {s}")))?;
    Ok(value * multiplier)
}
