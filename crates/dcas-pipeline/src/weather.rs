//! Weather feature builder.
//!
//! Reads the wide per-grid weather snapshot (one temperature/rainfall column
//! per epoch) and derives the row features: daily and cumulative GDD,
//! seasonal precipitation, growth-stage precipitation, and the pass-through
//! scalars for the processing date.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;

use crate::error::{PipelineError, Result};
use crate::grid_crop::GridCropRow;
use crate::parquet_util::{col_f64, col_i64, opt_f64, read_batches, write_single_batch};

/// Daily weather series and processing-date scalars for one grid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridWeather {
    /// Daily maximum temperature, aligned to the epoch list.
    pub max_temperature: Vec<Option<f64>>,
    /// Daily minimum temperature, aligned to the epoch list.
    pub min_temperature: Vec<Option<f64>>,
    /// Daily total rainfall, aligned to the epoch list.
    pub total_rainfall: Vec<Option<f64>>,
    /// Mean temperature on the processing date.
    pub temperature: Option<f64>,
    /// Relative humidity on the processing date.
    pub humidity: Option<f64>,
    /// Precipitation over potential evapotranspiration.
    pub p_pet: Option<f64>,
}

/// The weather snapshot for a run: every grid's series over one epoch list.
#[derive(Debug, Clone, Default)]
pub struct WeatherTable {
    /// Daily UTC-midnight epochs covered by the snapshot, ascending.
    pub epoch_list: Vec<i64>,
    /// Per-grid series.
    pub grids: HashMap<u64, GridWeather>,
}

const MAX_TEMP_PREFIX: &str = "max_temperature_";
const MIN_TEMP_PREFIX: &str = "min_temperature_";
const RAINFALL_PREFIX: &str = "total_rainfall_";

impl WeatherTable {
    /// Reads the wide weather parquet, recovering the epoch list from the
    /// `max_temperature_<epoch>` column names.
    ///
    /// # Errors
    /// Returns an error if the payload is invalid or a per-epoch column set
    /// is incomplete.
    pub fn from_parquet(bytes: &Bytes) -> Result<Self> {
        let batches = read_batches(bytes)?;
        let mut epoch_list: Vec<i64> = Vec::new();
        if let Some(first) = batches.first() {
            for field in first.schema().fields() {
                if let Some(suffix) = field.name().strip_prefix(MAX_TEMP_PREFIX) {
                    let epoch = suffix.parse::<i64>().map_err(|_| {
                        PipelineError::parquet(format!(
                            "bad weather column name: {}",
                            field.name()
                        ))
                    })?;
                    epoch_list.push(epoch);
                }
            }
        }
        epoch_list.sort_unstable();

        let mut grids = HashMap::new();
        for batch in &batches {
            let grid_id = col_i64(batch, "grid_id")?;
            let temperature = col_f64(batch, "temperature")?;
            let humidity = col_f64(batch, "humidity")?;
            let p_pet = col_f64(batch, "p_pet")?;

            let mut max_cols = Vec::with_capacity(epoch_list.len());
            let mut min_cols = Vec::with_capacity(epoch_list.len());
            let mut rain_cols = Vec::with_capacity(epoch_list.len());
            for epoch in &epoch_list {
                max_cols.push(col_f64(batch, &format!("{MAX_TEMP_PREFIX}{epoch}"))?);
                min_cols.push(col_f64(batch, &format!("{MIN_TEMP_PREFIX}{epoch}"))?);
                rain_cols.push(col_f64(batch, &format!("{RAINFALL_PREFIX}{epoch}"))?);
            }

            for row in 0..batch.num_rows() {
                let weather = GridWeather {
                    max_temperature: max_cols.iter().map(|c| opt_f64(c, row)).collect(),
                    min_temperature: min_cols.iter().map(|c| opt_f64(c, row)).collect(),
                    total_rainfall: rain_cols.iter().map(|c| opt_f64(c, row)).collect(),
                    temperature: opt_f64(temperature, row),
                    humidity: opt_f64(humidity, row),
                    p_pet: opt_f64(p_pet, row),
                };
                grids.insert(grid_id.value(row) as u64, weather);
            }
        }

        Ok(Self { epoch_list, grids })
    }

    /// Serializes the snapshot in the wide layout. Used by fixtures and for
    /// persisting downsampled snapshots.
    ///
    /// # Errors
    /// Returns an error if a grid's series is not aligned to the epoch list
    /// or the parquet write fails.
    pub fn to_parquet(&self) -> Result<Bytes> {
        let mut fields = vec![
            Field::new("grid_id", DataType::Int64, false),
            Field::new("temperature", DataType::Float64, true),
            Field::new("humidity", DataType::Float64, true),
            Field::new("p_pet", DataType::Float64, true),
        ];
        for epoch in &self.epoch_list {
            fields.push(Field::new(
                format!("{MAX_TEMP_PREFIX}{epoch}"),
                DataType::Float64,
                true,
            ));
            fields.push(Field::new(
                format!("{MIN_TEMP_PREFIX}{epoch}"),
                DataType::Float64,
                true,
            ));
            fields.push(Field::new(
                format!("{RAINFALL_PREFIX}{epoch}"),
                DataType::Float64,
                true,
            ));
        }
        let schema = Arc::new(Schema::new(fields));

        let mut grid_ids: Vec<u64> = self.grids.keys().copied().collect();
        grid_ids.sort_unstable();

        let series = |pick: fn(&GridWeather) -> &Vec<Option<f64>>, idx: usize| -> Result<ArrayRef> {
            let mut values = Vec::with_capacity(grid_ids.len());
            for id in &grid_ids {
                let grid = &self.grids[id];
                let vec = pick(grid);
                if vec.len() != self.epoch_list.len() {
                    return Err(PipelineError::parquet(format!(
                        "grid {id} weather series has {} entries, epoch list has {}",
                        vec.len(),
                        self.epoch_list.len()
                    )));
                }
                values.push(vec[idx]);
            }
            Ok(Arc::new(Float64Array::from(values)))
        };

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from(
                grid_ids.iter().map(|id| *id as i64).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                grid_ids
                    .iter()
                    .map(|id| self.grids[id].temperature)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                grid_ids
                    .iter()
                    .map(|id| self.grids[id].humidity)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                grid_ids
                    .iter()
                    .map(|id| self.grids[id].p_pet)
                    .collect::<Vec<_>>(),
            )),
        ];
        for idx in 0..self.epoch_list.len() {
            columns.push(series(|g| &g.max_temperature, idx)?);
            columns.push(series(|g| &g.min_temperature, idx)?);
            columns.push(series(|g| &g.total_rainfall, idx)?);
        }

        let batch = RecordBatch::try_new(schema.clone(), columns)
            .map_err(|e| PipelineError::parquet(format!("record batch build failed: {e}")))?;
        write_single_batch(schema, &batch)
    }
}

/// One day's GDD contribution: capped mean temperature above base.
#[must_use]
pub fn gdd_day(tmax: f64, tmin: f64, base: f64, cap: f64) -> f64 {
    let tmax = tmax.min(cap);
    let tmin = tmin.max(base);
    (tmax + tmin) / 2.0 - base
}

/// Fills the GDD and precipitation features on a grid-crop row.
///
/// Days are accumulated from the day after planting; earlier epochs carry a
/// null cumulative value. A day with missing temperature leaves a null at
/// that position without resetting the running sum. `total_gdd` is the
/// cumulative value at the last epoch; a null there is routed to the error
/// log by the caller.
pub fn apply_gdd(row: &mut GridCropRow, weather: &WeatherTable, base: f64, cap: f64) {
    let Some(grid) = weather.grids.get(&row.grid_id) else {
        row.gdd_sum = vec![None; weather.epoch_list.len()];
        row.total_gdd = None;
        return;
    };

    let mut acc = 0.0;
    let mut gdd_sum = Vec::with_capacity(weather.epoch_list.len());
    for (idx, epoch) in weather.epoch_list.iter().enumerate() {
        if row.planting_date_epoch >= *epoch {
            gdd_sum.push(None);
            continue;
        }
        match (
            grid.max_temperature.get(idx).copied().flatten(),
            grid.min_temperature.get(idx).copied().flatten(),
        ) {
            (Some(tmax), Some(tmin)) => {
                acc += gdd_day(tmax, tmin, base, cap);
                gdd_sum.push(Some(acc));
            }
            _ => gdd_sum.push(None),
        }
    }

    row.total_gdd = gdd_sum.last().copied().flatten();
    row.gdd_sum = gdd_sum;
    row.seasonal_precipitation = rainfall_since(grid, &weather.epoch_list, row.planting_date_epoch);
    row.temperature = grid.temperature;
    row.humidity = grid.humidity;
    row.p_pet = grid.p_pet;
}

/// Fills `growth_stage_precipitation`: rainfall accumulated since the
/// resolved stage began. Requires the growth-stage resolver to have run.
pub fn apply_growth_stage_precipitation(row: &mut GridCropRow, weather: &WeatherTable) {
    let Some(start) = row.growth_stage_start_date else {
        row.growth_stage_precipitation = None;
        return;
    };
    let Some(grid) = weather.grids.get(&row.grid_id) else {
        row.growth_stage_precipitation = None;
        return;
    };
    row.growth_stage_precipitation = rainfall_since(grid, &weather.epoch_list, start);
}

fn rainfall_since(grid: &GridWeather, epoch_list: &[i64], since: i64) -> Option<f64> {
    let mut sum = 0.0;
    let mut seen = false;
    for (idx, epoch) in epoch_list.iter().enumerate() {
        if *epoch < since {
            continue;
        }
        if let Some(rain) = grid.total_rainfall.get(idx).copied().flatten() {
            sum += rain;
            seen = true;
        }
    }
    seen.then_some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dcas_core::keys::{daily_epochs, date_to_epoch, GridCropKey};

    fn constant_weather(epochs: &[i64], tmax: f64, tmin: f64, rain: f64) -> WeatherTable {
        let n = epochs.len();
        let grid = GridWeather {
            max_temperature: vec![Some(tmax); n],
            min_temperature: vec![Some(tmin); n],
            total_rainfall: vec![Some(rain); n],
            temperature: Some(25.0),
            humidity: Some(70.0),
            p_pet: Some(0.8),
        };
        WeatherTable {
            epoch_list: epochs.to_vec(),
            grids: HashMap::from([(7, grid)]),
        }
    }

    fn row_for(planting: NaiveDate) -> GridCropRow {
        GridCropRow::new(
            GridCropKey {
                crop_id: 3,
                crop_stage_type_id: 1,
                grid_id: 7,
                planting_date_epoch: date_to_epoch(planting),
            },
            1,
        )
    }

    #[test]
    fn gdd_day_caps_and_floors() {
        // tmax 40 capped to 35, tmin 8 floored to 12: (35+12)/2 - 12 = 11.5
        assert_eq!(gdd_day(40.0, 8.0, 12.0, 35.0), 11.5);
        // In-range values pass through: (30+20)/2 - 12 = 13
        assert_eq!(gdd_day(30.0, 20.0, 12.0, 35.0), 13.0);
    }

    #[test]
    fn accumulation_starts_after_planting() {
        let planting = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let processing = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let epochs = daily_epochs(planting, processing);
        let weather = constant_weather(&epochs, 30.0, 20.0, 2.0);

        let mut row = row_for(planting);
        apply_gdd(&mut row, &weather, 12.0, 35.0);

        // Planting day itself does not accumulate.
        assert_eq!(row.gdd_sum[0], None);
        assert_eq!(row.gdd_sum[1], Some(13.0));
        // 54 accumulating days at 13 GDD each.
        assert_eq!(row.total_gdd, Some(702.0));
        // Rainfall includes the planting day.
        assert_eq!(row.seasonal_precipitation, Some(2.0 * 55.0));
        assert_eq!(row.temperature, Some(25.0));
    }

    #[test]
    fn missing_day_leaves_null_without_resetting_sum() {
        let planting = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 1, 13).unwrap();
        let epochs = daily_epochs(planting, end);
        let mut weather = constant_weather(&epochs, 30.0, 20.0, 0.0);
        weather.grids.get_mut(&7).unwrap().max_temperature[2] = None;

        let mut row = row_for(planting);
        apply_gdd(&mut row, &weather, 12.0, 35.0);

        assert_eq!(row.gdd_sum, vec![None, Some(13.0), None, Some(26.0), Some(39.0)]);
        assert_eq!(row.total_gdd, Some(39.0));
    }

    #[test]
    fn unknown_grid_yields_null_total() {
        let planting = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let epochs = daily_epochs(planting, NaiveDate::from_ymd_opt(2025, 1, 12).unwrap());
        let mut weather = constant_weather(&epochs, 30.0, 20.0, 0.0);
        weather.grids.clear();

        let mut row = row_for(planting);
        apply_gdd(&mut row, &weather, 12.0, 35.0);
        assert_eq!(row.total_gdd, None);
        assert!(row.gdd_sum.iter().all(Option::is_none));
    }

    #[test]
    fn growth_stage_precipitation_counts_from_stage_start() {
        let planting = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 1, 13).unwrap();
        let epochs = daily_epochs(planting, end);
        let weather = constant_weather(&epochs, 30.0, 20.0, 3.0);

        let mut row = row_for(planting);
        row.growth_stage_start_date = Some(epochs[2]);
        apply_growth_stage_precipitation(&mut row, &weather);
        // Three epochs at or after the stage start.
        assert_eq!(row.growth_stage_precipitation, Some(9.0));
    }

    #[test]
    fn wide_parquet_roundtrip() {
        let planting = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let epochs = daily_epochs(planting, NaiveDate::from_ymd_opt(2025, 1, 11).unwrap());
        let table = constant_weather(&epochs, 30.0, 20.0, 1.5);

        let bytes = table.to_parquet().expect("write");
        let recovered = WeatherTable::from_parquet(&bytes).expect("read");

        assert_eq!(recovered.epoch_list, table.epoch_list);
        assert_eq!(recovered.grids.get(&7), table.grids.get(&7));
    }
}
