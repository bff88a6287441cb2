//! Parquet encode/decode helpers shared by the pipeline stages.
//!
//! The intermediate grid-crop table, the farm registry snapshot, the output
//! dataset, and the error log all go through these helpers so compression and
//! writer properties stay consistent across the run.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use crate::error::{PipelineError, Result};

pub(crate) fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build()
}

pub(crate) fn write_single_batch(schema: Arc<Schema>, batch: &RecordBatch) -> Result<Bytes> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let props = writer_properties();
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(props))
        .map_err(|e| PipelineError::parquet(format!("parquet writer init failed: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| PipelineError::parquet(format!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| PipelineError::parquet(format!("parquet close failed: {e}")))?;
    Ok(Bytes::from(cursor.into_inner()))
}

pub(crate) fn read_batches(bytes: &Bytes) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes.clone())
        .map_err(|e| PipelineError::parquet(format!("parquet reader init failed: {e}")))?
        .build()
        .map_err(|e| PipelineError::parquet(format!("parquet reader build failed: {e}")))?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch
            .map_err(|e| PipelineError::parquet(format!("parquet read batch failed: {e}")))?;
        batches.push(batch);
    }
    Ok(batches)
}

fn column_index(batch: &RecordBatch, name: &str) -> Result<usize> {
    batch
        .schema()
        .index_of(name)
        .map_err(|e| PipelineError::parquet(format!("missing column '{name}': {e}")))
}

pub(crate) fn col_string<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    let idx = column_index(batch, name)?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| PipelineError::parquet(format!("column '{name}' is not StringArray")))
}

pub(crate) fn col_string_optional<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<Option<&'a StringArray>> {
    let idx = match batch.schema().index_of(name) {
        Ok(idx) => idx,
        Err(_) => return Ok(None),
    };
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .map(Some)
        .ok_or_else(|| PipelineError::parquet(format!("column '{name}' is not StringArray")))
}

pub(crate) fn col_i64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    let idx = column_index(batch, name)?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| PipelineError::parquet(format!("column '{name}' is not Int64Array")))
}

pub(crate) fn col_i32<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int32Array> {
    let idx = column_index(batch, name)?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int32Array>()
        .ok_or_else(|| PipelineError::parquet(format!("column '{name}' is not Int32Array")))
}

pub(crate) fn col_f64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    let idx = column_index(batch, name)?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| PipelineError::parquet(format!("column '{name}' is not Float64Array")))
}

pub(crate) fn col_bool<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a BooleanArray> {
    let idx = column_index(batch, name)?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| PipelineError::parquet(format!("column '{name}' is not BooleanArray")))
}

pub(crate) fn opt_i32(col: &Int32Array, row: usize) -> Option<i32> {
    if col.is_null(row) {
        None
    } else {
        Some(col.value(row))
    }
}

pub(crate) fn opt_i64(col: &Int64Array, row: usize) -> Option<i64> {
    if col.is_null(row) {
        None
    } else {
        Some(col.value(row))
    }
}

pub(crate) fn opt_f64(col: &Float64Array, row: usize) -> Option<f64> {
    if col.is_null(row) {
        None
    } else {
        Some(col.value(row))
    }
}

pub(crate) fn opt_string(col: &StringArray, row: usize) -> Option<String> {
    if col.is_null(row) {
        None
    } else {
        Some(col.value(row).to_string())
    }
}

/// Message codes travel as nullable Int32 in parquet but are `u32` in memory.
pub(crate) fn opt_code(col: &Int32Array, row: usize) -> Option<u32> {
    opt_i32(col, row).and_then(|v| u32::try_from(v).ok())
}

pub(crate) fn code_to_i32(code: Option<u32>) -> Option<i32> {
    code.and_then(|c| i32::try_from(c).ok())
}
