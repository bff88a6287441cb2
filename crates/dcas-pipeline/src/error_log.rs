//! Per-request error log.
//!
//! Rows that cannot produce an advisory, or that produce one under a
//! fallback, are recorded here and persisted as parquet under
//! `dcas_error_log/request_id=<id>/` alongside the run's outputs.

use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::info;

use dcas_core::keys::RequestId;
use dcas_core::partition::DCAS_ERROR_LOG_DIR;
use dcas_core::storage::StorageBackend;

use crate::error::{PipelineError, Result};
use crate::parquet_util::{
    col_i64, col_string, col_string_optional, opt_string, read_batches, write_single_batch,
};

/// Why a farm row landed in the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No rule fired for the row.
    MissingMessages,
    /// The row could not be processed at all.
    ProcessingFailure,
    /// The top candidate repeated last week's message and a fallback was used.
    FoundRepetitive,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Stable string form used in the persisted log.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingMessages => "MISSING_MESSAGES",
            Self::ProcessingFailure => "PROCESSING_FAILURE",
            Self::FoundRepetitive => "FOUND_REPETITIVE",
            Self::Other => "OTHER",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "MISSING_MESSAGES" => Self::MissingMessages,
            "PROCESSING_FAILURE" => Self::ProcessingFailure,
            "FOUND_REPETITIVE" => Self::FoundRepetitive,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged row.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    /// Farm the row belonged to.
    pub farm_id: u64,
    /// Grid-crop key in canonical string form.
    pub grid_crop_key: String,
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Row parameters serialized as JSON, when available.
    pub parameters: Option<String>,
    /// When the record was logged.
    pub logged_at: DateTime<Utc>,
}

/// Collects error records during a run and persists them at the end.
#[derive(Debug, Default)]
pub struct ErrorLog {
    records: Vec<ErrorRecord>,
}

impl ErrorLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record.
    pub fn push(
        &mut self,
        farm_id: u64,
        grid_crop_key: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        parameters: Option<String>,
    ) {
        self.records.push(ErrorRecord {
            farm_id,
            grid_crop_key: grid_crop_key.into(),
            kind,
            message: message.into(),
            parameters,
            logged_at: Utc::now(),
        });
    }

    /// Number of collected records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Collected records.
    #[must_use]
    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    /// Number of records of one kind.
    #[must_use]
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("farm_id", DataType::Int64, false),
            Field::new("grid_crop_key", DataType::Utf8, false),
            Field::new("error_type", DataType::Utf8, false),
            Field::new("message", DataType::Utf8, false),
            Field::new("parameters", DataType::Utf8, true),
            Field::new("logged_at", DataType::Utf8, false),
        ]))
    }

    /// Serializes the log to a single parquet payload.
    ///
    /// # Errors
    /// Returns an error if batch construction or the write fails.
    pub fn to_parquet(&self) -> Result<Bytes> {
        let schema = Self::schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(
                    self.records
                        .iter()
                        .map(|r| r.farm_id as i64)
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    self.records
                        .iter()
                        .map(|r| Some(r.grid_crop_key.as_str()))
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    self.records
                        .iter()
                        .map(|r| Some(r.kind.as_str()))
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    self.records
                        .iter()
                        .map(|r| Some(r.message.as_str()))
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    self.records
                        .iter()
                        .map(|r| r.parameters.as_deref())
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    self.records
                        .iter()
                        .map(|r| Some(r.logged_at.to_rfc3339()))
                        .collect::<Vec<_>>(),
                )),
            ],
        )
        .map_err(|e| PipelineError::parquet(format!("error log batch build failed: {e}")))?;
        write_single_batch(schema, &batch)
    }

    /// Reads a persisted log back.
    ///
    /// # Errors
    /// Returns an error on an invalid payload or missing columns.
    pub fn from_parquet(bytes: &Bytes) -> Result<Self> {
        let mut records = Vec::new();
        for batch in read_batches(bytes)? {
            let farm_id = col_i64(&batch, "farm_id")?;
            let key = col_string(&batch, "grid_crop_key")?;
            let kind = col_string(&batch, "error_type")?;
            let message = col_string(&batch, "message")?;
            let parameters = col_string_optional(&batch, "parameters")?;
            let logged_at = col_string(&batch, "logged_at")?;
            for row in 0..batch.num_rows() {
                let timestamp = DateTime::parse_from_rfc3339(logged_at.value(row))
                    .map_err(|e| PipelineError::parquet(format!("bad logged_at: {e}")))?
                    .with_timezone(&Utc);
                records.push(ErrorRecord {
                    farm_id: farm_id.value(row) as u64,
                    grid_crop_key: key.value(row).to_string(),
                    kind: ErrorKind::parse(kind.value(row)),
                    message: message.value(row).to_string(),
                    parameters: parameters.and_then(|col| opt_string(col, row)),
                    logged_at: timestamp,
                });
            }
        }
        Ok(Self { records })
    }

    /// Persists the log under the request's error-log prefix. An empty log
    /// writes nothing and returns `None`.
    ///
    /// # Errors
    /// Returns an error if serialization or the upload fails.
    pub async fn persist(
        &self,
        backend: &dyn StorageBackend,
        request_id: &RequestId,
    ) -> Result<Option<String>> {
        if self.is_empty() {
            return Ok(None);
        }
        let path = format!("{DCAS_ERROR_LOG_DIR}/request_id={request_id}/errors.parquet");
        let bytes = self.to_parquet()?;
        let uri = backend
            .put(&path, bytes, "application/vnd.apache.parquet")
            .await?;
        info!(records = self.len(), uri = %uri, "persisted error log");
        Ok(Some(uri))
    }
}
