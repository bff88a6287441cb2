//! Hive-style output partition addressing.
//!
//! Advisory output is laid out as
//! `dcas_output/iso_a3=<country>/year=<y>/month=<m>/day=<d>/`, one leaf
//! directory per (country, processing date). The partition values appear both
//! in the path and as columns inside the parquet files, so SQL engines can
//! prune on either.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root prefix of the advisory output dataset.
pub const DCAS_OUTPUT_DIR: &str = "dcas_output";

/// Root prefix of the per-request error log dataset.
pub const DCAS_ERROR_LOG_DIR: &str = "dcas_error_log";

/// Prefix under which exported CSV files are delivered.
pub const DCAS_CSV_DIR: &str = "dcas_csv";

/// One hive-style output partition: a (country, processing date) leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputPartition {
    /// ISO 3166-1 alpha-3 country code.
    pub iso_a3: String,
    /// Processing date year.
    pub year: i32,
    /// Processing date month (1-12).
    pub month: u32,
    /// Processing date day of month (1-31).
    pub day: u32,
}

impl OutputPartition {
    /// Builds the partition for a country and processing date.
    #[must_use]
    pub fn new(iso_a3: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            iso_a3: iso_a3.into(),
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }

    /// Returns the processing date of the partition.
    ///
    /// # Errors
    /// Returns an error if year/month/day do not form a valid date.
    pub fn date(&self) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day).ok_or_else(|| {
            Error::InvalidInput(format!(
                "invalid partition date {}-{}-{}",
                self.year, self.month, self.day
            ))
        })
    }

    /// Returns the partition directory prefix, without a trailing slash.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!(
            "{DCAS_OUTPUT_DIR}/iso_a3={}/year={}/month={}/day={}",
            self.iso_a3, self.year, self.month, self.day
        )
    }

    /// Returns the path of the nth parquet file within the partition.
    #[must_use]
    pub fn file_path(&self, index: usize) -> String {
        format!("{}/part-{index:05}.parquet", self.prefix())
    }

    /// Parses a partition from an object path under the output root.
    ///
    /// Accepts both directory prefixes and full file paths.
    ///
    /// # Errors
    /// Returns an error if a segment is missing or malformed.
    pub fn parse(path: &str) -> Result<Self> {
        let mut iso_a3 = None;
        let mut year = None;
        let mut month = None;
        let mut day = None;

        for segment in path.split('/') {
            if let Some((key, value)) = segment.split_once('=') {
                match key {
                    "iso_a3" => iso_a3 = Some(value.to_string()),
                    "year" => year = value.parse::<i32>().ok(),
                    "month" => month = value.parse::<u32>().ok(),
                    "day" => day = value.parse::<u32>().ok(),
                    _ => {}
                }
            }
        }

        match (iso_a3, year, month, day) {
            (Some(iso_a3), Some(year), Some(month), Some(day)) => Ok(Self {
                iso_a3,
                year,
                month,
                day,
            }),
            _ => Err(Error::InvalidInput(format!(
                "not a valid output partition path: {path}"
            ))),
        }
    }
}

impl fmt::Display for OutputPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_uses_hive_layout() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        let partition = OutputPartition::new("KEN", date);
        assert_eq!(
            partition.prefix(),
            "dcas_output/iso_a3=KEN/year=2025/month=3/day=7"
        );
        assert_eq!(
            partition.file_path(0),
            "dcas_output/iso_a3=KEN/year=2025/month=3/day=7/part-00000.parquet"
        );
    }

    #[test]
    fn parse_roundtrip_from_file_path() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        let partition = OutputPartition::new("TZA", date);
        let parsed = OutputPartition::parse(&partition.file_path(3)).expect("parse");
        assert_eq!(parsed, partition);
        assert_eq!(parsed.date().unwrap(), date);
    }

    #[test]
    fn parse_rejects_incomplete_paths() {
        assert!(OutputPartition::parse("dcas_output/iso_a3=KEN/year=2025").is_err());
        assert!(OutputPartition::parse("some/other/path.parquet").is_err());
    }
}
