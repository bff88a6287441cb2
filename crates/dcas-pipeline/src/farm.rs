//! Farm registry snapshot and fan-out stage.
//!
//! The registry is a columnar snapshot per farm group. After the grid-crop
//! stages finish, fan-out inner-joins each farm onto its grid-crop result by
//! the four identifying keys and attaches the farm attributes, the stage
//! label, and the partition columns.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{Datelike, NaiveDate};

use dcas_core::catalog::RunCatalogs;
use dcas_core::keys::{date_to_epoch, GridCropKey};

use crate::error::{PipelineError, Result};
use crate::grid_crop::GridCropRow;
use crate::parquet_util::{
    col_i32, col_i64, col_string, col_string_optional, opt_string, read_batches,
    write_single_batch,
};

/// One farm from the registry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FarmRecord {
    /// Farm identifier within the registry.
    pub farm_id: u64,
    /// Stable external farm identifier.
    pub farm_unique_id: String,
    /// Farm registry group this snapshot belongs to.
    pub registry_id: u32,
    /// Spatial grid cell the farm falls in.
    pub grid_id: u64,
    /// Stable external grid identifier, when the snapshot carries one.
    pub grid_unique_id: Option<String>,
    /// Crop identifier.
    pub crop_id: u32,
    /// Crop stage type identifier.
    pub crop_stage_type_id: u32,
    /// Planting date.
    pub planting_date: NaiveDate,
    /// ISO 3166-1 alpha-3 country code.
    pub iso_a3: String,
    /// First-level administrative area.
    pub county: Option<String>,
    /// Second-level administrative area.
    pub subcounty: Option<String>,
    /// Third-level administrative area.
    pub ward: Option<String>,
    /// Preferred message language ("en" or "sw").
    pub preferred_language: Option<String>,
    /// Point longitude, degrees.
    pub longitude: Option<f64>,
    /// Point latitude, degrees.
    pub latitude: Option<f64>,
}

impl FarmRecord {
    /// Returns the farm's grid-crop key.
    #[must_use]
    pub fn grid_crop_key(&self) -> GridCropKey {
        GridCropKey {
            crop_id: self.crop_id,
            crop_stage_type_id: self.crop_stage_type_id,
            grid_id: self.grid_id,
            planting_date_epoch: date_to_epoch(self.planting_date),
        }
    }
}

/// A per-farm output row: farm attributes joined with the grid-crop result.
#[derive(Debug, Clone, PartialEq)]
pub struct FarmOutputRow {
    /// Farm attributes from the registry.
    pub farm: FarmRecord,
    /// Human label `"{crop}_{stage_type}"`.
    pub crop_label: Option<String>,
    /// Human label of the resolved growth stage.
    pub growth_stage_label: Option<String>,
    /// Grid-crop result columns.
    pub result: GridCropRow,
    /// Processing date, used for the partition columns.
    pub processing_date: NaiveDate,
}

impl FarmOutputRow {
    /// Partition year column.
    #[must_use]
    pub fn year(&self) -> i32 {
        self.processing_date.year()
    }

    /// Partition month column.
    #[must_use]
    pub fn month(&self) -> u32 {
        self.processing_date.month()
    }

    /// Partition day column.
    #[must_use]
    pub fn day(&self) -> u32 {
        self.processing_date.day()
    }
}

/// Parses a WKB point into (longitude, latitude).
///
/// Supports the plain 2D point encoding in either byte order. Anything else
/// is treated as an absent geometry.
#[must_use]
pub fn parse_wkb_point(wkb: &[u8]) -> Option<(f64, f64)> {
    if wkb.len() < 21 {
        return None;
    }
    let little_endian = match wkb[0] {
        0 => false,
        1 => true,
        _ => return None,
    };
    let read_u32 = |bytes: &[u8]| -> u32 {
        let arr: [u8; 4] = bytes.try_into().ok().unwrap_or_default();
        if little_endian {
            u32::from_le_bytes(arr)
        } else {
            u32::from_be_bytes(arr)
        }
    };
    let read_f64 = |bytes: &[u8]| -> f64 {
        let arr: [u8; 8] = bytes.try_into().ok().unwrap_or_default();
        if little_endian {
            f64::from_le_bytes(arr)
        } else {
            f64::from_be_bytes(arr)
        }
    };
    if read_u32(&wkb[1..5]) != 1 {
        return None;
    }
    Some((read_f64(&wkb[5..13]), read_f64(&wkb[13..21])))
}

/// Encodes a (longitude, latitude) pair as a little-endian WKB point.
#[must_use]
pub fn encode_wkb_point(longitude: f64, latitude: f64) -> Vec<u8> {
    let mut wkb = Vec::with_capacity(21);
    wkb.push(1u8);
    wkb.extend_from_slice(&1u32.to_le_bytes());
    wkb.extend_from_slice(&longitude.to_le_bytes());
    wkb.extend_from_slice(&latitude.to_le_bytes());
    wkb
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn registry_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("farm_id", DataType::Int64, false),
        Field::new("farm_unique_id", DataType::Utf8, false),
        Field::new("grid_id", DataType::Int64, false),
        Field::new("grid_unique_id", DataType::Utf8, true),
        Field::new("crop_id", DataType::Int32, false),
        Field::new("crop_stage_type_id", DataType::Int32, false),
        Field::new("planting_date", DataType::Utf8, false),
        Field::new("country", DataType::Utf8, false),
        Field::new("county", DataType::Utf8, true),
        Field::new("subcounty", DataType::Utf8, true),
        Field::new("ward", DataType::Utf8, true),
        Field::new("preferred_language", DataType::Utf8, true),
        Field::new("geometry", DataType::Binary, true),
    ]))
}

/// Reads a farm registry snapshot. Coordinates are extracted from the WKB
/// point geometry and rounded to four decimal places.
///
/// # Errors
/// Returns an error on an invalid payload, missing required columns, or an
/// unparseable planting date.
pub fn read_registry(bytes: &Bytes, registry_id: u32) -> Result<Vec<FarmRecord>> {
    let mut farms = Vec::new();
    for batch in read_batches(bytes)? {
        let farm_id = col_i64(&batch, "farm_id")?;
        let farm_unique_id = col_string(&batch, "farm_unique_id")?;
        let grid_id = col_i64(&batch, "grid_id")?;
        let grid_unique_id = col_string_optional(&batch, "grid_unique_id")?;
        let crop_id = col_i32(&batch, "crop_id")?;
        let crop_stage_type_id = col_i32(&batch, "crop_stage_type_id")?;
        let planting_date = col_string(&batch, "planting_date")?;
        let country = col_string(&batch, "country")?;
        let county = col_string_optional(&batch, "county")?;
        let subcounty = col_string_optional(&batch, "subcounty")?;
        let ward = col_string_optional(&batch, "ward")?;
        let preferred_language = col_string_optional(&batch, "preferred_language")?;
        let geometry = geometry_column(&batch)?;

        for row in 0..batch.num_rows() {
            let planting = planting_date.value(row);
            let planting = NaiveDate::parse_from_str(planting, "%Y-%m-%d").map_err(|e| {
                PipelineError::parquet(format!("bad planting_date '{planting}': {e}"))
            })?;
            let point = geometry.and_then(|col| {
                if col.is_null(row) {
                    None
                } else {
                    parse_wkb_point(col.value(row))
                }
            });
            farms.push(FarmRecord {
                farm_id: farm_id.value(row) as u64,
                farm_unique_id: farm_unique_id.value(row).to_string(),
                registry_id,
                grid_id: grid_id.value(row) as u64,
                grid_unique_id: grid_unique_id.and_then(|col| opt_string(col, row)),
                crop_id: crop_id.value(row) as u32,
                crop_stage_type_id: crop_stage_type_id.value(row) as u32,
                planting_date: planting,
                iso_a3: country.value(row).to_string(),
                county: county.and_then(|col| opt_string(col, row)),
                subcounty: subcounty.and_then(|col| opt_string(col, row)),
                ward: ward.and_then(|col| opt_string(col, row)),
                preferred_language: preferred_language.and_then(|col| opt_string(col, row)),
                longitude: point.map(|(lon, _)| round4(lon)),
                latitude: point.map(|(_, lat)| round4(lat)),
            });
        }
    }
    Ok(farms)
}

fn geometry_column(batch: &RecordBatch) -> Result<Option<&BinaryArray>> {
    let idx = match batch.schema().index_of("geometry") {
        Ok(idx) => idx,
        Err(_) => return Ok(None),
    };
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<BinaryArray>()
        .map(Some)
        .ok_or_else(|| PipelineError::parquet("column 'geometry' is not BinaryArray"))
}

/// Serializes farm records in the registry snapshot layout. Used by
/// fixtures and snapshot tooling.
///
/// # Errors
/// Returns an error if the parquet write fails.
pub fn write_registry(farms: &[FarmRecord]) -> Result<Bytes> {
    let schema = registry_schema();
    let geometry: Vec<Option<Vec<u8>>> = farms
        .iter()
        .map(|f| match (f.longitude, f.latitude) {
            (Some(lon), Some(lat)) => Some(encode_wkb_point(lon, lat)),
            _ => None,
        })
        .collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(
            farms.iter().map(|f| f.farm_id as i64).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            farms
                .iter()
                .map(|f| Some(f.farm_unique_id.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            farms.iter().map(|f| f.grid_id as i64).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            farms
                .iter()
                .map(|f| f.grid_unique_id.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            farms.iter().map(|f| f.crop_id as i32).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            farms
                .iter()
                .map(|f| f.crop_stage_type_id as i32)
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            farms
                .iter()
                .map(|f| Some(f.planting_date.format("%Y-%m-%d").to_string()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            farms
                .iter()
                .map(|f| Some(f.iso_a3.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            farms.iter().map(|f| f.county.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            farms
                .iter()
                .map(|f| f.subcounty.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            farms.iter().map(|f| f.ward.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            farms
                .iter()
                .map(|f| f.preferred_language.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(BinaryArray::from(
            geometry
                .iter()
                .map(|g| g.as_deref())
                .collect::<Vec<Option<&[u8]>>>(),
        )),
    ];

    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| PipelineError::parquet(format!("record batch build failed: {e}")))?;
    write_single_batch(schema, &batch)
}

/// Expands grid-crop results back to per-farm rows.
///
/// Inner join on the four identifying keys: a farm whose grid-crop row was
/// dropped (grid-level processing failure) produces no output row here; the
/// error log already carries it.
#[must_use]
pub fn fan_out(
    farms: &[FarmRecord],
    results: &HashMap<GridCropKey, GridCropRow>,
    catalogs: &RunCatalogs,
    processing_date: NaiveDate,
) -> Vec<FarmOutputRow> {
    let stage_labels = catalogs.growth_stage_labels();
    farms
        .iter()
        .filter_map(|farm| {
            let result = results.get(&farm.grid_crop_key())?;
            let growth_stage_label = result
                .growth_stage_id
                .and_then(|id| stage_labels.get(&id).cloned());
            Some(FarmOutputRow {
                farm: farm.clone(),
                crop_label: catalogs.crop_label(farm.crop_id, farm.crop_stage_type_id),
                growth_stage_label,
                result: result.clone(),
                processing_date,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcas_core::catalog::{Crop, CropStageType, GrowthStage};

    fn farm(farm_id: u64, grid_id: u64) -> FarmRecord {
        FarmRecord {
            farm_id,
            farm_unique_id: format!("F-{farm_id}"),
            registry_id: 1,
            grid_id,
            grid_unique_id: None,
            crop_id: 3,
            crop_stage_type_id: 1,
            planting_date: NaiveDate::from_ymd_opt(2025, 1, 9).unwrap(),
            iso_a3: "KEN".into(),
            county: Some("Nakuru".into()),
            subcounty: Some("Njoro".into()),
            ward: None,
            preferred_language: Some("sw".into()),
            longitude: Some(36.0712),
            latitude: Some(-0.3031),
        }
    }

    #[test]
    fn wkb_point_roundtrip() {
        let wkb = encode_wkb_point(36.0712, -0.3031);
        assert_eq!(parse_wkb_point(&wkb), Some((36.0712, -0.3031)));
    }

    #[test]
    fn wkb_rejects_non_points() {
        // geometry type 2 (linestring)
        let mut wkb = encode_wkb_point(1.0, 2.0);
        wkb[1] = 2;
        assert_eq!(parse_wkb_point(&wkb), None);
        assert_eq!(parse_wkb_point(&[1, 2, 3]), None);
    }

    #[test]
    fn registry_roundtrip() {
        let farms = vec![farm(1, 7), farm(2, 8)];
        let bytes = write_registry(&farms).expect("write");
        let recovered = read_registry(&bytes, 1).expect("read");
        assert_eq!(recovered, farms);
    }

    #[test]
    fn coordinates_round_to_four_places() {
        let mut source = farm(1, 7);
        source.longitude = Some(36.071_249_9);
        source.latitude = Some(-0.303_149_9);
        let bytes = write_registry(&[source]).expect("write");
        let recovered = read_registry(&bytes, 1).expect("read");
        assert_eq!(recovered[0].longitude, Some(36.0712));
        assert_eq!(recovered[0].latitude, Some(-0.3031));
    }

    #[test]
    fn fan_out_is_an_inner_join() {
        let farms = vec![farm(1, 7), farm(2, 8)];
        let mut result = GridCropRow::new(farms[0].grid_crop_key(), 1);
        result.growth_stage_id = Some(2);
        let results = HashMap::from([(farms[0].grid_crop_key(), result)]);

        let catalogs = RunCatalogs {
            crops: vec![Crop {
                id: 3,
                name: "Cassava".into(),
            }],
            crop_stage_types: vec![CropStageType {
                id: 1,
                name: "Early".into(),
            }],
            growth_stages: vec![GrowthStage {
                id: 2,
                label: "Vegetative".into(),
            }],
            ..RunCatalogs::default()
        };

        let processing = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let rows = fan_out(&farms, &results, &catalogs, processing);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].farm.farm_id, 1);
        assert_eq!(rows[0].crop_label.as_deref(), Some("Cassava_Early"));
        assert_eq!(rows[0].growth_stage_label.as_deref(), Some("Vegetative"));
        assert_eq!(rows[0].year(), 2025);
        assert_eq!(rows[0].month(), 3);
        assert_eq!(rows[0].day(), 4);
    }
}
