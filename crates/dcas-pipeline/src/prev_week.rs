//! Previous-run joins.
//!
//! Two lookups over earlier output partitions: the previous week's final
//! message per grid-crop key, which feeds the repetition fallback, and a
//! multi-week history of sent codes per farm and crop, which drives optional
//! message suppression.

use std::collections::{HashMap, HashSet};

use chrono::{Duration, NaiveDate};
use tracing::info;

use dcas_core::keys::GridCropKey;
use dcas_core::storage::StorageBackend;

use crate::error::Result;
use crate::farm::FarmOutputRow;
use crate::grid_crop::GridCropRow;
use crate::output::{load_rows_for_date, load_rows_in_window, OutputRecord};

/// Previous week's final message per grid-crop key.
///
/// Built from the output partition exactly seven days before the processing
/// date, scoped to the run's farm registry groups. A missing partition is an
/// empty map, not an error: rows simply carry no previous message.
#[derive(Debug, Default)]
pub struct PrevWeekMessages {
    messages: HashMap<GridCropKey, u32>,
}

impl PrevWeekMessages {
    /// Loads the map for a processing date, keeping only rows from the given
    /// registry groups.
    ///
    /// # Errors
    /// Returns an error only when a present partition cannot be read.
    pub async fn load(
        backend: &dyn StorageBackend,
        processing_date: NaiveDate,
        registries: &HashSet<u32>,
    ) -> Result<Self> {
        let prev_date = processing_date - Duration::days(7);
        let rows = load_rows_for_date(backend, prev_date).await?;
        let mut messages = HashMap::new();
        for row in rows {
            if !registries.contains(&row.registry_id) {
                continue;
            }
            if let Some(code) = row.final_message {
                messages.insert(row.key(), code);
            }
        }
        info!(
            prev_date = %prev_date,
            keys = messages.len(),
            "loaded previous week's final messages"
        );
        Ok(Self { messages })
    }

    /// Builds the map from already-loaded records, for tests and carry-over.
    #[must_use]
    pub fn from_records(records: &[OutputRecord]) -> Self {
        let mut messages = HashMap::new();
        for row in records {
            if let Some(code) = row.final_message {
                messages.insert(row.key(), code);
            }
        }
        Self { messages }
    }

    /// Returns the previous final message for a key.
    #[must_use]
    pub fn get(&self, key: &GridCropKey) -> Option<u32> {
        self.messages.get(key).copied()
    }

    /// Stamps `prev_week_message` onto each row before message selection.
    pub fn apply(&self, rows: &mut [GridCropRow]) {
        for row in rows {
            row.prev_week_message = self.get(&row.key());
        }
    }
}

/// Multi-week history of delivered codes, keyed by farm, crop, and code,
/// carrying the latest processing date each code was sent.
#[derive(Debug, Default)]
pub struct MessageHistory {
    latest_sent: HashMap<(u64, u32, u32), NaiveDate>,
}

impl MessageHistory {
    /// Loads every output partition whose date falls in
    /// `[processing_date - 7 * weeks, processing_date)`, keeping only rows
    /// from the given registry groups. Days without output contribute
    /// nothing.
    ///
    /// # Errors
    /// Returns an error only when a present partition cannot be read.
    pub async fn load(
        backend: &dyn StorageBackend,
        processing_date: NaiveDate,
        weeks: u32,
        registries: &HashSet<u32>,
    ) -> Result<Self> {
        let start = processing_date - Duration::days(7 * i64::from(weeks));
        let rows = load_rows_in_window(backend, start, processing_date).await?;
        let mut history = Self::default();
        for row in rows.iter().filter(|r| registries.contains(&r.registry_id)) {
            history.record(row);
        }
        info!(
            start = %start,
            end = %processing_date,
            codes = history.latest_sent.len(),
            "loaded multi-week message history"
        );
        Ok(history)
    }

    fn record(&mut self, row: &OutputRecord) {
        for code in row.messages.iter().flatten() {
            let entry = self
                .latest_sent
                .entry((row.farm_id, row.crop_id, *code))
                .or_insert(row.processing_date);
            if row.processing_date > *entry {
                *entry = row.processing_date;
            }
        }
    }

    /// True when the code was already sent to the farm for the crop within
    /// the loaded window.
    #[must_use]
    pub fn was_sent(&self, farm_id: u64, crop_id: u32, code: u32) -> bool {
        self.latest_sent.contains_key(&(farm_id, crop_id, code))
    }

    /// Number of (farm, crop, code) entries in the loaded window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.latest_sent.len()
    }

    /// True when the window held no delivered codes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latest_sent.is_empty()
    }

    /// Nulls already-sent codes in place in one farm row's message columns.
    ///
    /// Columns are not compacted and the final message is left untouched, so
    /// reapplying the pass is a no-op. Returns the number of suppressed slots.
    pub fn suppress_row(&self, row: &mut FarmOutputRow) -> usize {
        let farm_id = row.farm.farm_id;
        let crop_id = row.farm.crop_id;
        let mut suppressed = 0;
        for slot in row.result.messages.iter_mut() {
            if let Some(code) = *slot {
                if self.was_sent(farm_id, crop_id, code) {
                    *slot = None;
                    suppressed += 1;
                }
            }
        }
        suppressed
    }

    /// [`Self::suppress_row`] over a slice, summing the suppressed slots.
    pub fn suppress(&self, rows: &mut [FarmOutputRow]) -> usize {
        rows.iter_mut().map(|row| self.suppress_row(row)).sum()
    }
}
