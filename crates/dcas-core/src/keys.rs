//! Strongly-typed identifiers and epoch helpers.
//!
//! The pipeline addresses its working set by `GridCropKey`, the unique key of
//! a (crop, stage type, grid, planting date) tuple. All dates on the wire are
//! UTC-midnight epoch seconds; the helpers here are the single conversion
//! point so every stage agrees on the encoding.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Unique identifier of a pipeline request (one run for one processing date).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a new unique request id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("req_{}", ulid::Ulid::new().to_string().to_lowercase()))
    }

    /// Returns the id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifying key of one grid-crop row.
///
/// Canonical form is `{crop_id}_{crop_stage_type_id}_{grid_id}_{planting_date_epoch}`,
/// unique within a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCropKey {
    /// Crop identifier.
    pub crop_id: u32,
    /// Crop stage type identifier (e.g. Early/Mid/Late).
    pub crop_stage_type_id: u32,
    /// Spatial grid cell identifier.
    pub grid_id: u64,
    /// Planting date as UTC-midnight epoch seconds.
    pub planting_date_epoch: i64,
}

impl GridCropKey {
    /// Returns the canonical underscore-delimited key string.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.crop_id, self.crop_stage_type_id, self.grid_id, self.planting_date_epoch
        )
    }
}

impl fmt::Display for GridCropKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl FromStr for GridCropKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 4 {
            return Err(Error::InvalidId {
                message: format!("grid-crop key must have 4 segments: {s}"),
            });
        }
        let parse = |segment: &str, what: &str| -> Result<i64> {
            segment.parse::<i64>().map_err(|_| Error::InvalidId {
                message: format!("invalid {what} in grid-crop key: {s}"),
            })
        };
        Ok(Self {
            crop_id: u32::try_from(parse(parts[0], "crop id")?).map_err(|_| Error::InvalidId {
                message: format!("crop id out of range: {s}"),
            })?,
            crop_stage_type_id: u32::try_from(parse(parts[1], "stage type id")?).map_err(|_| {
                Error::InvalidId {
                    message: format!("stage type id out of range: {s}"),
                }
            })?,
            grid_id: u64::try_from(parse(parts[2], "grid id")?).map_err(|_| Error::InvalidId {
                message: format!("grid id out of range: {s}"),
            })?,
            planting_date_epoch: parse(parts[3], "planting epoch")?,
        })
    }
}

/// Converts a calendar date to UTC-midnight epoch seconds.
#[must_use]
pub fn date_to_epoch(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Converts UTC-midnight epoch seconds back to a calendar date.
///
/// # Errors
/// Returns an error if the epoch is out of the representable range.
pub fn epoch_to_date(epoch: i64) -> Result<NaiveDate> {
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| Error::InvalidInput(format!("epoch out of range: {epoch}")))
}

/// Builds the inclusive list of daily UTC-midnight epochs in `[start, end]`.
#[must_use]
pub fn daily_epochs(start: NaiveDate, end: NaiveDate) -> Vec<i64> {
    let mut epochs = Vec::new();
    let mut current = start;
    while current <= end {
        epochs.push(date_to_epoch(current));
        current = current.succ_opt().expect("date overflow");
    }
    epochs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_crop_key_roundtrip() {
        let key = GridCropKey {
            crop_id: 3,
            crop_stage_type_id: 1,
            grid_id: 4521,
            planting_date_epoch: 1_736_380_800,
        };
        assert_eq!(key.canonical(), "3_1_4521_1736380800");
        let parsed: GridCropKey = key.canonical().parse().expect("parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn grid_crop_key_rejects_malformed() {
        assert!("3_1_4521".parse::<GridCropKey>().is_err());
        assert!("a_b_c_d".parse::<GridCropKey>().is_err());
    }

    #[test]
    fn epoch_conversion_is_utc_midnight() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let epoch = date_to_epoch(date);
        assert_eq!(epoch % 86_400, 0);
        assert_eq!(epoch_to_date(epoch).unwrap(), date);
    }

    #[test]
    fn daily_epochs_are_contiguous() {
        let start = NaiveDate::from_ymd_opt(2025, 2, 27).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        let epochs = daily_epochs(start, end);
        assert_eq!(epochs.len(), 4);
        for pair in epochs.windows(2) {
            assert_eq!(pair[1] - pair[0], 86_400);
        }
    }

    #[test]
    fn request_id_has_prefix() {
        let id = RequestId::generate();
        assert!(id.as_str().starts_with("req_"));
    }
}
