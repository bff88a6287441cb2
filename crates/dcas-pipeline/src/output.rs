//! Output stage.
//!
//! Persists per-farm rows as a hive-partitioned zstd parquet dataset, then
//! materializes the per-request CSV with an embedded SQL engine and delivers
//! it to the object store and/or SFTP. Also owns the retention sweep over
//! delivered CSV artifacts.

use std::collections::BTreeMap;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::datasource::MemTable;
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::prelude::{SessionConfig, SessionContext};
use std::io::Write as _;
use tracing::{info, warn};

use dcas_core::catalog::RunCatalogs;
use dcas_core::keys::GridCropKey;
use dcas_core::partition::{OutputPartition, DCAS_CSV_DIR, DCAS_OUTPUT_DIR};
use dcas_core::storage::StorageBackend;

use crate::error::{PipelineError, Result};
use crate::farm::FarmOutputRow;
use crate::parquet_util::{
    code_to_i32, col_i32, col_i64, col_string, opt_code, opt_i64, read_batches,
    write_single_batch,
};

const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

fn output_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("farm_id", DataType::Int64, false),
        Field::new("farm_unique_id", DataType::Utf8, false),
        Field::new("registry_id", DataType::Int32, false),
        Field::new("grid_id", DataType::Int64, false),
        Field::new("grid_unique_id", DataType::Utf8, true),
        Field::new("crop", DataType::Utf8, true),
        Field::new("crop_id", DataType::Int32, false),
        Field::new("crop_stage_type_id", DataType::Int32, false),
        Field::new("planting_date_epoch", DataType::Int64, false),
        Field::new("growth_stage", DataType::Utf8, true),
        Field::new("growth_stage_id", DataType::Int32, true),
        Field::new("growth_stage_start_date", DataType::Int64, true),
        Field::new("total_gdd", DataType::Float64, true),
        Field::new("seasonal_precipitation", DataType::Float64, true),
        Field::new("growth_stage_precipitation", DataType::Float64, true),
        Field::new("temperature", DataType::Float64, true),
        Field::new("humidity", DataType::Float64, true),
        Field::new("p_pet", DataType::Float64, true),
        Field::new("message", DataType::Int32, true),
        Field::new("message_2", DataType::Int32, true),
        Field::new("message_3", DataType::Int32, true),
        Field::new("message_4", DataType::Int32, true),
        Field::new("message_5", DataType::Int32, true),
        Field::new("final_message", DataType::Int32, true),
        Field::new("prev_week_message", DataType::Int32, true),
        Field::new("is_empty_message", DataType::Boolean, false),
        Field::new("has_repetitive_message", DataType::Boolean, false),
        Field::new("county", DataType::Utf8, true),
        Field::new("subcounty", DataType::Utf8, true),
        Field::new("ward", DataType::Utf8, true),
        Field::new("preferred_language", DataType::Utf8, true),
        Field::new("longitude", DataType::Float64, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("iso_a3", DataType::Utf8, false),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
        Field::new("day", DataType::Int32, false),
    ]))
}

fn code_column(rows: &[FarmOutputRow], pick: impl Fn(&FarmOutputRow) -> Option<u32>) -> ArrayRef {
    Arc::new(Int32Array::from(
        rows.iter().map(|r| code_to_i32(pick(r))).collect::<Vec<_>>(),
    ))
}

/// Serializes farm output rows to a single parquet file in the output
/// dataset schema. Partition keys are embedded as columns in addition to
/// appearing in the path.
///
/// # Errors
/// Returns an error if batch construction or the parquet write fails.
pub fn write_output(rows: &[FarmOutputRow]) -> Result<Bytes> {
    let schema = output_schema();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.farm.farm_id as i64).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| Some(r.farm.farm_unique_id.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter()
                .map(|r| r.farm.registry_id as i32)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.farm.grid_id as i64).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.farm.grid_unique_id.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.crop_label.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.farm.crop_id as i32).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter()
                .map(|r| r.farm.crop_stage_type_id as i32)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter()
                .map(|r| r.result.planting_date_epoch)
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.growth_stage_label.as_deref())
                .collect::<Vec<_>>(),
        )),
        code_column(rows, |r| r.result.growth_stage_id),
        Arc::new(Int64Array::from(
            rows.iter()
                .map(|r| r.result.growth_stage_start_date)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.result.total_gdd).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.result.seasonal_precipitation)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.result.growth_stage_precipitation)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.result.temperature).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.result.humidity).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.result.p_pet).collect::<Vec<_>>(),
        )),
        code_column(rows, |r| r.result.messages[0]),
        code_column(rows, |r| r.result.messages[1]),
        code_column(rows, |r| r.result.messages[2]),
        code_column(rows, |r| r.result.messages[3]),
        code_column(rows, |r| r.result.messages[4]),
        code_column(rows, |r| r.result.final_message),
        code_column(rows, |r| r.result.prev_week_message),
        Arc::new(BooleanArray::from(
            rows.iter()
                .map(|r| r.result.is_empty_message)
                .collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            rows.iter()
                .map(|r| r.result.has_repetitive_message)
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.farm.county.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.farm.subcounty.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.farm.ward.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.farm.preferred_language.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.farm.longitude).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.farm.latitude).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| Some(r.farm.iso_a3.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(FarmOutputRow::year).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.month() as i32).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.day() as i32).collect::<Vec<_>>(),
        )),
    ];

    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| PipelineError::parquet(format!("record batch build failed: {e}")))?;
    write_single_batch(schema, &batch)
}

/// The subset of output columns read back for joins against prior runs.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    /// Farm identifier.
    pub farm_id: u64,
    /// Stable external farm identifier.
    pub farm_unique_id: String,
    /// Farm registry group the row came from.
    pub registry_id: u32,
    /// Grid cell identifier.
    pub grid_id: u64,
    /// Crop identifier.
    pub crop_id: u32,
    /// Crop stage type identifier.
    pub crop_stage_type_id: u32,
    /// Planting date epoch seconds.
    pub planting_date_epoch: i64,
    /// Resolved growth stage.
    pub growth_stage_id: Option<u32>,
    /// Stage start date epoch seconds.
    pub growth_stage_start_date: Option<i64>,
    /// Ordered advisory codes.
    pub messages: [Option<u32>; 5],
    /// Selected final message.
    pub final_message: Option<u32>,
    /// Country of the partition the row came from.
    pub iso_a3: String,
    /// Processing date of the partition the row came from.
    pub processing_date: NaiveDate,
}

impl OutputRecord {
    /// Returns the row's grid-crop key.
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

/// Reads output rows back from a partition file.
///
/// # Errors
/// Returns an error on an invalid payload or missing columns.
pub fn read_output(bytes: &Bytes) -> Result<Vec<OutputRecord>> {
    let mut out = Vec::new();
    for batch in read_batches(bytes)? {
        let farm_id = col_i64(&batch, "farm_id")?;
        let farm_unique_id = col_string(&batch, "farm_unique_id")?;
        let registry_id = col_i32(&batch, "registry_id")?;
        let grid_id = col_i64(&batch, "grid_id")?;
        let crop_id = col_i32(&batch, "crop_id")?;
        let crop_stage_type_id = col_i32(&batch, "crop_stage_type_id")?;
        let planting = col_i64(&batch, "planting_date_epoch")?;
        let stage = col_i32(&batch, "growth_stage_id")?;
        let stage_start = col_i64(&batch, "growth_stage_start_date")?;
        let message_cols = [
            col_i32(&batch, "message")?,
            col_i32(&batch, "message_2")?,
            col_i32(&batch, "message_3")?,
            col_i32(&batch, "message_4")?,
            col_i32(&batch, "message_5")?,
        ];
        let final_message = col_i32(&batch, "final_message")?;
        let iso_a3 = col_string(&batch, "iso_a3")?;
        let year = col_i32(&batch, "year")?;
        let month = col_i32(&batch, "month")?;
        let day = col_i32(&batch, "day")?;

        for row in 0..batch.num_rows() {
            let date = NaiveDate::from_ymd_opt(
                year.value(row),
                month.value(row) as u32,
                day.value(row) as u32,
            )
            .ok_or_else(|| PipelineError::parquet("invalid partition date columns"))?;
            let mut messages = [None; 5];
            for (slot, col) in messages.iter_mut().zip(message_cols.iter()) {
                *slot = opt_code(col, row);
            }
            out.push(OutputRecord {
                farm_id: farm_id.value(row) as u64,
                farm_unique_id: farm_unique_id.value(row).to_string(),
                registry_id: registry_id.value(row) as u32,
                grid_id: grid_id.value(row) as u64,
                crop_id: crop_id.value(row) as u32,
                crop_stage_type_id: crop_stage_type_id.value(row) as u32,
                planting_date_epoch: planting.value(row),
                growth_stage_id: opt_code(stage, row),
                growth_stage_start_date: opt_i64(stage_start, row),
                messages,
                final_message: opt_code(final_message, row),
                iso_a3: iso_a3.value(row).to_string(),
                processing_date: date,
            });
        }
    }
    Ok(out)
}

/// Writes farm output rows to their hive partitions, replacing any existing
/// files under each touched partition. Untouched partitions are left alone.
///
/// # Errors
/// Returns an error if serialization or a storage operation fails.
pub async fn write_partitions(
    backend: &dyn StorageBackend,
    rows: &[FarmOutputRow],
) -> Result<Vec<OutputPartition>> {
    let mut grouped: BTreeMap<String, (OutputPartition, Vec<FarmOutputRow>)> = BTreeMap::new();
    for row in rows {
        let partition = OutputPartition::new(row.farm.iso_a3.clone(), row.processing_date);
        grouped
            .entry(partition.prefix())
            .or_insert_with(|| (partition, Vec::new()))
            .1
            .push(row.clone());
    }

    let mut written = Vec::with_capacity(grouped.len());
    for (_, (partition, partition_rows)) in grouped {
        let bytes = write_output(&partition_rows)?;
        let prefix = format!("{}/", partition.prefix());
        backend.delete_prefix(&prefix).await?;
        let uri = backend
            .put(&partition.file_path(0), bytes, PARQUET_CONTENT_TYPE)
            .await?;
        info!(
            partition = %partition,
            rows = partition_rows.len(),
            uri = %uri,
            "wrote output partition"
        );
        written.push(partition);
    }
    Ok(written)
}

/// Loads every output row whose processing date falls in `[start, end)`,
/// across all countries. A missing dataset yields an empty vec.
///
/// # Errors
/// Returns an error if listing or reading fails for a present object.
pub async fn load_rows_in_window(
    backend: &dyn StorageBackend,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<OutputRecord>> {
    let mut rows = Vec::new();
    for meta in backend.list(&format!("{DCAS_OUTPUT_DIR}/")).await? {
        let Ok(partition) = OutputPartition::parse(&meta.path) else {
            continue;
        };
        let date = partition.date()?;
        if date < start || date >= end {
            continue;
        }
        let bytes = backend.get(&meta.path).await?;
        rows.extend(read_output(&bytes)?);
    }
    Ok(rows)
}

/// Loads every output row for one processing date across all countries.
///
/// # Errors
/// Returns an error if listing or reading fails for a present object.
pub async fn load_rows_for_date(
    backend: &dyn StorageBackend,
    date: NaiveDate,
) -> Result<Vec<OutputRecord>> {
    load_rows_in_window(backend, date, date + chrono::Duration::days(1)).await
}

/// Options for the CSV projection.
#[derive(Debug, Clone)]
pub struct CsvExportOptions {
    /// Logical columns to export, in order.
    pub columns: Vec<String>,
    /// SQL engine thread budget; engine default when unset.
    pub num_threads: Option<usize>,
    /// SQL engine memory pool in bytes; unbounded when unset.
    pub memory_limit: Option<u64>,
}

impl Default for CsvExportOptions {
    fn default() -> Self {
        Self {
            columns: dcas_core::config::DEFAULT_CSV_COLUMNS
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
            num_threads: None,
            memory_limit: None,
        }
    }
}

fn csv_column_expr(logical: &str) -> Result<String> {
    let expr = match logical {
        "farmer_id" | "farm_unique_id" => "o.farm_unique_id",
        "message" => "o.message",
        "message_2" => "o.message_2",
        "message_3" => "o.message_3",
        "message_4" => "o.message_4",
        "message_5" => "o.message_5",
        "message_code" => "o.final_message",
        "final_message" | "message_final" => {
            "CASE WHEN o.preferred_language = 'sw' \
             THEN COALESCE(t.template_sw, t.template_en) \
             ELSE t.template_en END"
        }
        "message_english" => "t.template_en",
        "message_swahili" => "t.template_sw",
        "crop" => "o.crop",
        "planting_date" => {
            "to_char(to_timestamp_seconds(o.planting_date_epoch), '%Y-%m-%d')"
        }
        "growth_stage" => "o.growth_stage",
        "growth_stage_date" => {
            "to_char(to_timestamp_seconds(o.growth_stage_start_date), '%Y-%m-%d')"
        }
        "county" => "o.county",
        "subcounty" => "o.subcounty",
        "ward" => "o.ward",
        "preferred_language" => "o.preferred_language",
        "relative_humidity" => "o.humidity",
        "temperature" => "o.temperature",
        "ppet" => "o.p_pet",
        "seasonal_precipitation" => "o.seasonal_precipitation",
        "growth_stage_precipitation" => "o.growth_stage_precipitation",
        "total_gdd" => "o.total_gdd",
        "final_longitude" => "o.longitude",
        "final_latitude" => "o.latitude",
        "grid_id" => "o.grid_id",
        "timestamp" => "to_char(to_timestamp_seconds(o.planting_date_epoch), '%Y-%m-%d')",
        "year" => "o.year",
        "month" => "o.month",
        "day" => "o.day",
        other => {
            return Err(PipelineError::sql(format!(
                "unsupported CSV column: {other}"
            )))
        }
    };
    Ok(format!("{expr} AS \"{logical}\""))
}

/// CSV projection over the written output dataset.
///
/// A DataFusion session reads the partitioned dataset under `products_root`,
/// left-joins the message-template table to translate `final_message` per
/// `preferred_language` (English fallback), and projects the configured
/// column set, ordered by farm id for stable output.
pub struct CsvExporter {
    catalogs: Arc<RunCatalogs>,
    options: CsvExportOptions,
}

impl CsvExporter {
    /// Creates an exporter over the run catalogs.
    #[must_use]
    pub fn new(catalogs: Arc<RunCatalogs>, options: CsvExportOptions) -> Self {
        Self { catalogs, options }
    }

    /// Returns the delivery filename for a processing date.
    #[must_use]
    pub fn filename(date: NaiveDate) -> String {
        format!("DCAS_output_{}.csv", date.format("%Y%m%d"))
    }

    /// Materializes the CSV for one processing date.
    ///
    /// # Errors
    /// Returns an error if the dataset cannot be read, a requested column is
    /// unsupported, or the query fails.
    pub async fn export(&self, products_root: &Path, date: NaiveDate) -> Result<(String, Bytes)> {
        let ctx = self.session()?;
        self.register_output_table(&ctx, products_root).await?;
        self.register_templates(&ctx)?;

        let projection = self
            .options
            .columns
            .iter()
            .map(|c| csv_column_expr(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let sql = format!(
            "SELECT {projection} \
             FROM dcas_output o \
             LEFT JOIN message_template t ON o.final_message = t.code \
             WHERE o.year = {} AND o.month = {} AND o.day = {} \
             ORDER BY o.farm_id",
            date.format("%Y"),
            date.format("%-m"),
            date.format("%-d"),
        );

        let df = ctx.sql(&sql).await.map_err(PipelineError::sql)?;
        let batches = df.collect().await.map_err(PipelineError::sql)?;

        let mut buffer = Vec::new();
        {
            let mut writer = arrow::csv::WriterBuilder::new()
                .with_header(true)
                .build(&mut buffer);
            for batch in &batches {
                writer
                    .write(batch)
                    .map_err(|e| PipelineError::sql(format!("csv write failed: {e}")))?;
            }
        }
        Ok((Self::filename(date), Bytes::from(buffer)))
    }

    fn session(&self) -> Result<SessionContext> {
        let mut config = SessionConfig::new();
        if let Some(threads) = self.options.num_threads {
            config = config.with_target_partitions(threads.max(1));
        }
        let mut runtime = RuntimeEnvBuilder::new();
        if let Some(limit) = self.options.memory_limit {
            runtime = runtime.with_memory_limit(limit as usize, 1.0);
        }
        let runtime = runtime.build_arc().map_err(PipelineError::sql)?;
        Ok(SessionContext::new_with_config_rt(config, runtime))
    }

    async fn register_output_table(
        &self,
        ctx: &SessionContext,
        products_root: &Path,
    ) -> Result<()> {
        let url = format!("file://{}/{DCAS_OUTPUT_DIR}/", products_root.display());
        let table_path = ListingTableUrl::parse(&url).map_err(PipelineError::sql)?;
        // Partition values are embedded as columns inside each file, so the
        // listing table needs no separate partition columns.
        let listing_options = ListingOptions::new(Arc::new(ParquetFormat::default()))
            .with_file_extension(".parquet");
        let schema = listing_options
            .infer_schema(&ctx.state(), &table_path)
            .await
            .map_err(PipelineError::sql)?;
        let table_config = ListingTableConfig::new(table_path)
            .with_listing_options(listing_options)
            .with_schema(schema);
        let table = ListingTable::try_new(table_config).map_err(PipelineError::sql)?;
        ctx.register_table("dcas_output", Arc::new(table))
            .map_err(PipelineError::sql)?;
        Ok(())
    }

    fn register_templates(&self, ctx: &SessionContext) -> Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("code", DataType::Int32, false),
            Field::new("template_en", DataType::Utf8, false),
            Field::new("template_sw", DataType::Utf8, true),
        ]));
        let templates = &self.catalogs.templates;
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int32Array::from(
                    templates
                        .iter()
                        .map(|t| t.code as i32)
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    templates
                        .iter()
                        .map(|t| Some(t.template_en.as_str()))
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    templates
                        .iter()
                        .map(|t| t.template_sw.as_deref())
                        .collect::<Vec<_>>(),
                )),
            ],
        )
        .map_err(|e| PipelineError::sql(format!("template batch build failed: {e}")))?;
        let table = MemTable::try_new(schema, vec![vec![batch]]).map_err(PipelineError::sql)?;
        ctx.register_table("message_template", Arc::new(table))
            .map_err(PipelineError::sql)?;
        Ok(())
    }
}

/// Uploads the CSV to the object store under `dcas_csv/`, returning the URI.
///
/// # Errors
/// Returns an error if the upload fails.
pub async fn deliver_to_store(
    backend: &dyn StorageBackend,
    filename: &str,
    data: Bytes,
) -> Result<String> {
    let path = format!("{DCAS_CSV_DIR}/{filename}");
    let uri = backend.put(&path, data, "text/csv").await?;
    info!(uri = %uri, "delivered CSV to object store");
    Ok(uri)
}

/// SFTP delivery endpoint.
#[derive(Debug, Clone)]
pub struct SftpConfig {
    /// Host and port, e.g. `sftp.example.org:22`.
    pub host: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Remote directory the CSV lands in.
    pub remote_path: String,
}

/// Uploads the CSV over SFTP. Blocking; callers run it on a blocking task.
///
/// # Errors
/// Returns an error on connection, authentication, or transfer failure.
pub fn deliver_to_sftp(config: &SftpConfig, filename: &str, data: &[u8]) -> Result<String> {
    let stream = TcpStream::connect(&config.host)
        .map_err(|e| PipelineError::sftp(format!("connect {} failed: {e}", config.host)))?;
    let mut session = ssh2::Session::new().map_err(PipelineError::sftp)?;
    session.set_tcp_stream(stream);
    session.handshake().map_err(PipelineError::sftp)?;
    session
        .userauth_password(&config.username, &config.password)
        .map_err(PipelineError::sftp)?;

    let sftp = session.sftp().map_err(PipelineError::sftp)?;
    let remote = format!("{}/{filename}", config.remote_path.trim_end_matches('/'));
    let mut file = sftp
        .create(Path::new(&remote))
        .map_err(|e| PipelineError::sftp(format!("create {remote} failed: {e}")))?;
    file.write_all(data)
        .map_err(|e| PipelineError::sftp(format!("write {remote} failed: {e}")))?;
    info!(remote = %remote, "delivered CSV over SFTP");
    Ok(remote)
}

/// Deletes delivered CSV artifacts older than the retention horizon.
/// Returns the number of objects removed.
///
/// # Errors
/// Returns an error if listing or deletion fails.
pub async fn sweep_expired_csv(
    backend: &dyn StorageBackend,
    now: DateTime<Utc>,
    retention_days: i64,
) -> Result<usize> {
    let cutoff = now - chrono::Duration::days(retention_days);
    let mut removed = 0;
    for meta in backend.list(&format!("{DCAS_CSV_DIR}/")).await? {
        match meta.last_modified {
            Some(modified) if modified < cutoff => {
                backend.delete(&meta.path).await?;
                removed += 1;
            }
            Some(_) => {}
            None => warn!(path = %meta.path, "object has no modification time, skipping sweep"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm::FarmRecord;
    use crate::grid_crop::GridCropRow;
    use dcas_core::storage::MemoryBackend;

    fn sample_row(farm_id: u64, iso_a3: &str, date: NaiveDate) -> FarmOutputRow {
        let farm = FarmRecord {
            farm_id,
            farm_unique_id: format!("F-{farm_id}"),
            registry_id: 1,
            grid_id: 7,
            grid_unique_id: None,
            crop_id: 3,
            crop_stage_type_id: 1,
            planting_date: NaiveDate::from_ymd_opt(2025, 1, 9).unwrap(),
            iso_a3: iso_a3.to_string(),
            county: Some("Nakuru".into()),
            subcounty: None,
            ward: None,
            preferred_language: Some("en".into()),
            longitude: Some(36.0712),
            latitude: Some(-0.3031),
        };
        let mut result = GridCropRow::new(farm.grid_crop_key(), 1);
        result.growth_stage_id = Some(2);
        result.total_gdd = Some(702.0);
        result.messages[0] = Some(101);
        result.final_message = Some(101);
        FarmOutputRow {
            farm,
            crop_label: Some("Cassava_Early".into()),
            growth_stage_label: Some("Vegetative".into()),
            result,
            processing_date: date,
        }
    }

    #[test]
    fn output_roundtrip_preserves_join_columns() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let row = sample_row(1, "KEN", date);
        let bytes = write_output(&[row.clone()]).expect("write");
        let records = read_output(&bytes).expect("read");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key(), row.farm.grid_crop_key());
        assert_eq!(records[0].final_message, Some(101));
        assert_eq!(records[0].growth_stage_id, Some(2));
        assert_eq!(records[0].processing_date, date);
        assert_eq!(records[0].iso_a3, "KEN");
    }

    #[tokio::test]
    async fn write_partitions_replaces_only_touched_partition() {
        let backend = MemoryBackend::new();
        let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();

        // Seed a stale file in the KEN partition and one in TZA.
        let ken = OutputPartition::new("KEN", date);
        let tza = OutputPartition::new("TZA", date);
        backend
            .put(&ken.file_path(7), Bytes::from("stale"), PARQUET_CONTENT_TYPE)
            .await
            .unwrap();
        backend
            .put(&tza.file_path(0), Bytes::from("other"), PARQUET_CONTENT_TYPE)
            .await
            .unwrap();

        let rows = vec![sample_row(1, "KEN", date)];
        let written = write_partitions(&backend, &rows).await.expect("write");
        assert_eq!(written, vec![ken.clone()]);

        // The stale KEN file is gone, replaced by part-00000.
        let ken_files = backend.list(&format!("{}/", ken.prefix())).await.unwrap();
        assert_eq!(ken_files.len(), 1);
        assert_eq!(ken_files[0].path, ken.file_path(0));

        // The TZA partition was untouched.
        let tza_files = backend.list(&format!("{}/", tza.prefix())).await.unwrap();
        assert_eq!(tza_files.len(), 1);
        assert_eq!(tza_files[0].path, tza.file_path(0));
    }

    #[tokio::test]
    async fn load_rows_for_date_filters_partitions() {
        let backend = MemoryBackend::new();
        let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let other_date = NaiveDate::from_ymd_opt(2025, 2, 25).unwrap();

        write_partitions(&backend, &[sample_row(1, "KEN", date)])
            .await
            .unwrap();
        write_partitions(&backend, &[sample_row(2, "KEN", other_date)])
            .await
            .unwrap();

        let rows = load_rows_for_date(&backend, date).await.expect("load");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].farm_id, 1);
        assert_eq!(rows[0].registry_id, 1);
    }

    #[tokio::test]
    async fn window_load_is_half_open() {
        let backend = MemoryBackend::new();
        let start = NaiveDate::from_ymd_opt(2025, 2, 18).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();

        // One partition on each boundary and one in the middle.
        for (farm_id, date) in [(1, start - chrono::Duration::days(1)), (2, start), (3, end)] {
            write_partitions(&backend, &[sample_row(farm_id, "KEN", date)])
                .await
                .unwrap();
        }
        write_partitions(
            &backend,
            &[sample_row(4, "KEN", NaiveDate::from_ymd_opt(2025, 2, 22).unwrap())],
        )
        .await
        .unwrap();

        let mut rows = load_rows_in_window(&backend, start, end).await.expect("load");
        rows.sort_by_key(|r| r.farm_id);
        assert_eq!(
            rows.iter().map(|r| r.farm_id).collect::<Vec<_>>(),
            vec![2, 4]
        );
    }

    #[tokio::test]
    async fn retention_sweep_removes_only_expired() {
        let backend = MemoryBackend::new();
        backend
            .put("dcas_csv/DCAS_output_20250304.csv", Bytes::from("a"), "text/csv")
            .await
            .unwrap();

        // Nothing is older than 14 days relative to now.
        let removed = sweep_expired_csv(&backend, Utc::now(), 14).await.unwrap();
        assert_eq!(removed, 0);

        // With the clock far in the future, everything expires.
        let removed = sweep_expired_csv(&backend, Utc::now() + chrono::Duration::days(30), 14)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(backend.list("dcas_csv/").await.unwrap().is_empty());
    }

    #[test]
    fn unknown_csv_column_is_rejected() {
        assert!(csv_column_expr("farmer_id").is_ok());
        assert!(csv_column_expr("bogus").is_err());
    }

    #[test]
    fn csv_filename_format() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        assert_eq!(CsvExporter::filename(date), "DCAS_output_20250304.csv");
    }
}
