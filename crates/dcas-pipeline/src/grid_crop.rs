//! Grid-crop data store.
//!
//! The grid-crop table is the working set of a run: one row per distinct
//! (grid, crop, stage type, planting date) tuple that has at least one
//! registered farm. Rows accumulate columns as the stages progress and are
//! persisted as an intermediate parquet table between stages, including one
//! `gdd_sum_<epoch>` column per day in the run's epoch list.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;

use dcas_core::catalog::RunCatalogs;
use dcas_core::keys::GridCropKey;

use crate::error::{PipelineError, Result};
use crate::farm::FarmRecord;
use crate::parquet_util::{
    code_to_i32, col_bool, col_f64, col_i32, col_i64, col_string, opt_code, opt_f64, opt_i32,
    opt_i64, read_batches, write_single_batch,
};

/// Growth-stage state carried forward from the previous run's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrevStageState {
    /// Growth stage resolved in the previous run.
    pub growth_stage_id: u32,
    /// Start date (epoch seconds) of that stage.
    pub growth_stage_start_date: i64,
}

/// One row of the grid-crop working set.
///
/// Columns are filled in stage order: identity and previous state at build
/// time, weather features next, then growth stage, then messages.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCropRow {
    /// Spatial grid cell identifier.
    pub grid_id: u64,
    /// Crop identifier.
    pub crop_id: u32,
    /// Crop stage type identifier.
    pub crop_stage_type_id: u32,
    /// DCAS configuration for the grid's country.
    pub config_id: u32,
    /// Planting date as UTC-midnight epoch seconds.
    pub planting_date_epoch: i64,
    /// Growth stage resolved by the previous run, when one exists.
    pub prev_growth_stage_id: Option<u32>,
    /// Start date of the previous run's stage.
    pub prev_growth_stage_start_date: Option<i64>,
    /// Cumulative GDD per epoch, aligned to the run's epoch list.
    /// `None` marks pre-planting days and missing weather.
    pub gdd_sum: Vec<Option<f64>>,
    /// Cumulative GDD at the last processed epoch.
    pub total_gdd: Option<f64>,
    /// Rainfall accumulated since planting.
    pub seasonal_precipitation: Option<f64>,
    /// Rainfall accumulated since the current stage began.
    pub growth_stage_precipitation: Option<f64>,
    /// Mean temperature on the processing date.
    pub temperature: Option<f64>,
    /// Relative humidity on the processing date.
    pub humidity: Option<f64>,
    /// Precipitation over potential evapotranspiration.
    pub p_pet: Option<f64>,
    /// Resolved growth stage.
    pub growth_stage_id: Option<u32>,
    /// Start date of the resolved stage (epoch seconds).
    pub growth_stage_start_date: Option<i64>,
    /// Ordered advisory codes (`message` .. `message_5`).
    pub messages: [Option<u32>; 5],
    /// Selected final message.
    pub final_message: Option<u32>,
    /// Final message from one week prior, when available.
    pub prev_week_message: Option<u32>,
    /// No rule fired for this row.
    pub is_empty_message: bool,
    /// The repetition fallback was applied to `final_message`.
    pub has_repetitive_message: bool,
}

impl GridCropRow {
    /// Creates a fresh row with identity columns only.
    #[must_use]
    pub fn new(key: GridCropKey, config_id: u32) -> Self {
        Self {
            grid_id: key.grid_id,
            crop_id: key.crop_id,
            crop_stage_type_id: key.crop_stage_type_id,
            config_id,
            planting_date_epoch: key.planting_date_epoch,
            prev_growth_stage_id: None,
            prev_growth_stage_start_date: None,
            gdd_sum: Vec::new(),
            total_gdd: None,
            seasonal_precipitation: None,
            growth_stage_precipitation: None,
            temperature: None,
            humidity: None,
            p_pet: None,
            growth_stage_id: None,
            growth_stage_start_date: None,
            messages: [None; 5],
            final_message: None,
            prev_week_message: None,
            is_empty_message: false,
            has_repetitive_message: false,
        }
    }

    /// Returns the row's identifying key.
    #[must_use]
    pub fn key(&self) -> GridCropKey {
        GridCropKey {
            crop_id: self.crop_id,
            crop_stage_type_id: self.crop_stage_type_id,
            grid_id: self.grid_id,
            planting_date_epoch: self.planting_date_epoch,
        }
    }
}

/// Builds the grid-crop working set from the farm registry.
///
/// The registry is deduplicated by (grid, crop, stage type, planting date),
/// each tuple picks up the DCAS configuration for its country, and previous
/// growth-stage state is carried forward where present. The output is sorted
/// by key so repeated runs over the same inputs are deterministic.
///
/// # Errors
/// A country with no mapped configuration is fatal.
pub fn build(
    farms: &[FarmRecord],
    catalogs: &RunCatalogs,
    prev_state: &HashMap<GridCropKey, PrevStageState>,
) -> Result<Vec<GridCropRow>> {
    let mut rows: BTreeMap<GridCropKey, GridCropRow> = BTreeMap::new();

    for farm in farms {
        let key = farm.grid_crop_key();
        if rows.contains_key(&key) {
            continue;
        }
        let config_id = catalogs.config_for_country(&farm.iso_a3).map_err(|_| {
            PipelineError::MissingConfigMapping {
                country: farm.iso_a3.clone(),
            }
        })?;
        let mut row = GridCropRow::new(key, config_id);
        if let Some(prev) = prev_state.get(&key) {
            row.prev_growth_stage_id = Some(prev.growth_stage_id);
            row.prev_growth_stage_start_date = Some(prev.growth_stage_start_date);
        }
        rows.insert(key, row);
    }

    Ok(rows.into_values().collect())
}

const GDD_SUM_PREFIX: &str = "gdd_sum_";

fn table_schema(epoch_list: &[i64]) -> Arc<Schema> {
    let mut fields = vec![
        Field::new("grid_crop_key", DataType::Utf8, false),
        Field::new("grid_id", DataType::Int64, false),
        Field::new("crop_id", DataType::Int32, false),
        Field::new("crop_stage_type_id", DataType::Int32, false),
        Field::new("config_id", DataType::Int32, false),
        Field::new("planting_date_epoch", DataType::Int64, false),
        Field::new("prev_growth_stage_id", DataType::Int32, true),
        Field::new("prev_growth_stage_start_date", DataType::Int64, true),
        Field::new("total_gdd", DataType::Float64, true),
        Field::new("seasonal_precipitation", DataType::Float64, true),
        Field::new("growth_stage_precipitation", DataType::Float64, true),
        Field::new("temperature", DataType::Float64, true),
        Field::new("humidity", DataType::Float64, true),
        Field::new("p_pet", DataType::Float64, true),
        Field::new("growth_stage_id", DataType::Int32, true),
        Field::new("growth_stage_start_date", DataType::Int64, true),
        Field::new("message", DataType::Int32, true),
        Field::new("message_2", DataType::Int32, true),
        Field::new("message_3", DataType::Int32, true),
        Field::new("message_4", DataType::Int32, true),
        Field::new("message_5", DataType::Int32, true),
        Field::new("final_message", DataType::Int32, true),
        Field::new("prev_week_message", DataType::Int32, true),
        Field::new("is_empty_message", DataType::Boolean, false),
        Field::new("has_repetitive_message", DataType::Boolean, false),
    ];
    for epoch in epoch_list {
        fields.push(Field::new(
            format!("{GDD_SUM_PREFIX}{epoch}"),
            DataType::Float64,
            true,
        ));
    }
    Arc::new(Schema::new(fields))
}

fn code_column(rows: &[GridCropRow], pick: impl Fn(&GridCropRow) -> Option<u32>) -> ArrayRef {
    Arc::new(Int32Array::from(
        rows.iter().map(|r| code_to_i32(pick(r))).collect::<Vec<_>>(),
    ))
}

/// Serializes the grid-crop table to a single parquet file.
///
/// Every row's `gdd_sum` must be aligned to `epoch_list`; shorter vectors are
/// padded with nulls.
///
/// # Errors
/// Returns an error if batch construction or the parquet write fails.
pub fn to_parquet(rows: &[GridCropRow], epoch_list: &[i64]) -> Result<Bytes> {
    let schema = table_schema(epoch_list);

    let keys = StringArray::from(rows.iter().map(|r| r.key().canonical()).collect::<Vec<_>>());
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(keys),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.grid_id as i64).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.crop_id as i32).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter()
                .map(|r| r.crop_stage_type_id as i32)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.config_id as i32).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.planting_date_epoch).collect::<Vec<_>>(),
        )),
        code_column(rows, |r| r.prev_growth_stage_id),
        Arc::new(Int64Array::from(
            rows.iter()
                .map(|r| r.prev_growth_stage_start_date)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.total_gdd).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.seasonal_precipitation)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.growth_stage_precipitation)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.temperature).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.humidity).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.p_pet).collect::<Vec<_>>(),
        )),
        code_column(rows, |r| r.growth_stage_id),
        Arc::new(Int64Array::from(
            rows.iter()
                .map(|r| r.growth_stage_start_date)
                .collect::<Vec<_>>(),
        )),
        code_column(rows, |r| r.messages[0]),
        code_column(rows, |r| r.messages[1]),
        code_column(rows, |r| r.messages[2]),
        code_column(rows, |r| r.messages[3]),
        code_column(rows, |r| r.messages[4]),
        code_column(rows, |r| r.final_message),
        code_column(rows, |r| r.prev_week_message),
        Arc::new(BooleanArray::from(
            rows.iter().map(|r| r.is_empty_message).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            rows.iter()
                .map(|r| r.has_repetitive_message)
                .collect::<Vec<_>>(),
        )),
    ];

    for (idx, _) in epoch_list.iter().enumerate() {
        columns.push(Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.gdd_sum.get(idx).copied().flatten())
                .collect::<Vec<_>>(),
        )));
    }

    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| PipelineError::parquet(format!("record batch build failed: {e}")))?;
    write_single_batch(schema, &batch)
}

/// Reads the grid-crop table back, recovering the epoch list from the
/// `gdd_sum_<epoch>` column names.
///
/// # Errors
/// Returns an error if the payload is invalid or a required column is
/// missing.
pub fn from_parquet(bytes: &Bytes) -> Result<(Vec<GridCropRow>, Vec<i64>)> {
    let batches = read_batches(bytes)?;
    let mut epoch_list: Vec<i64> = Vec::new();
    if let Some(first) = batches.first() {
        for field in first.schema().fields() {
            if let Some(suffix) = field.name().strip_prefix(GDD_SUM_PREFIX) {
                let epoch = suffix.parse::<i64>().map_err(|_| {
                    PipelineError::parquet(format!("bad gdd_sum column name: {}", field.name()))
                })?;
                epoch_list.push(epoch);
            }
        }
    }

    let mut rows = Vec::new();
    for batch in &batches {
        let grid_id = col_i64(batch, "grid_id")?;
        let crop_id = col_i32(batch, "crop_id")?;
        let crop_stage_type_id = col_i32(batch, "crop_stage_type_id")?;
        let config_id = col_i32(batch, "config_id")?;
        let planting = col_i64(batch, "planting_date_epoch")?;
        let prev_stage = col_i32(batch, "prev_growth_stage_id")?;
        let prev_start = col_i64(batch, "prev_growth_stage_start_date")?;
        let total_gdd = col_f64(batch, "total_gdd")?;
        let seasonal = col_f64(batch, "seasonal_precipitation")?;
        let stage_precip = col_f64(batch, "growth_stage_precipitation")?;
        let temperature = col_f64(batch, "temperature")?;
        let humidity = col_f64(batch, "humidity")?;
        let p_pet = col_f64(batch, "p_pet")?;
        let stage = col_i32(batch, "growth_stage_id")?;
        let stage_start = col_i64(batch, "growth_stage_start_date")?;
        let message_cols = [
            col_i32(batch, "message")?,
            col_i32(batch, "message_2")?,
            col_i32(batch, "message_3")?,
            col_i32(batch, "message_4")?,
            col_i32(batch, "message_5")?,
        ];
        let final_message = col_i32(batch, "final_message")?;
        let prev_week = col_i32(batch, "prev_week_message")?;
        let is_empty = col_bool(batch, "is_empty_message")?;
        let has_repetitive = col_bool(batch, "has_repetitive_message")?;

        let gdd_cols = epoch_list
            .iter()
            .map(|e| col_f64(batch, &format!("{GDD_SUM_PREFIX}{e}")))
            .collect::<Result<Vec<_>>>()?;

        for row in 0..batch.num_rows() {
            let mut messages = [None; 5];
            for (slot, col) in messages.iter_mut().zip(message_cols.iter()) {
                *slot = opt_code(col, row);
            }
            rows.push(GridCropRow {
                grid_id: grid_id.value(row) as u64,
                crop_id: crop_id.value(row) as u32,
                crop_stage_type_id: crop_stage_type_id.value(row) as u32,
                config_id: config_id.value(row) as u32,
                planting_date_epoch: planting.value(row),
                prev_growth_stage_id: opt_code(prev_stage, row),
                prev_growth_stage_start_date: opt_i64(prev_start, row),
                gdd_sum: gdd_cols.iter().map(|col| opt_f64(col, row)).collect(),
                total_gdd: opt_f64(total_gdd, row),
                seasonal_precipitation: opt_f64(seasonal, row),
                growth_stage_precipitation: opt_f64(stage_precip, row),
                temperature: opt_f64(temperature, row),
                humidity: opt_f64(humidity, row),
                p_pet: opt_f64(p_pet, row),
                growth_stage_id: opt_code(stage, row),
                growth_stage_start_date: opt_i64(stage_start, row),
                messages,
                final_message: opt_code(final_message, row),
                prev_week_message: opt_code(prev_week, row),
                is_empty_message: is_empty.value(row),
                has_repetitive_message: has_repetitive.value(row),
            });
        }
        // Validate the stored key column against the identity columns.
        let keys = col_string(batch, "grid_crop_key")?;
        let offset = rows.len() - batch.num_rows();
        for row in 0..batch.num_rows() {
            let expected = rows[offset + row].key().canonical();
            if keys.value(row) != expected {
                return Err(PipelineError::parquet(format!(
                    "grid_crop_key mismatch: stored {} computed {expected}",
                    keys.value(row)
                )));
            }
        }
    }
    Ok((rows, epoch_list))
}

/// Reads only the rows whose key is in `keys`. Row order is unspecified.
///
/// # Errors
/// Returns an error if the payload is invalid.
pub fn read_by_keys(bytes: &Bytes, keys: &HashSet<GridCropKey>) -> Result<Vec<GridCropRow>> {
    let (rows, _) = from_parquet(bytes)?;
    Ok(rows.into_iter().filter(|r| keys.contains(&r.key())).collect())
}
