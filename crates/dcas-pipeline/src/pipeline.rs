//! Run orchestration.
//!
//! [`DcasPipeline::run`] sequences the stages over one processing date:
//! registry and weather load, grid-crop build with previous-run carry-over,
//! GDD and growth-stage resolution, message selection with previous-week
//! dedup, farm fan-out, partitioned output, CSV export and delivery, and the
//! error-log flush. Heavy stages are chunked onto blocking tasks; a
//! [`CancelToken`] is honored at every work-unit boundary and flips the
//! request to `STOPPED` instead of failing it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use dcas_core::catalog::RunCatalogs;
use dcas_core::config::PipelineSettings;
use dcas_core::keys::{daily_epochs, epoch_to_date, GridCropKey, RequestId};
use dcas_core::observability::{pipeline_span, stage_span};
use dcas_core::partition::OutputPartition;
use dcas_core::storage::StorageBackend;

use crate::error::{PipelineError, Result};
use crate::error_log::{ErrorKind, ErrorLog};
use crate::farm::{self, FarmOutputRow, FarmRecord};
use crate::grid_crop::{self, GridCropRow, PrevStageState};
use crate::growth_stage::{self, GrowthStageMatrixCache};
use crate::metrics::{PipelineMetrics, StageTimer};
use crate::output::{self, CsvExportOptions, CsvExporter, SftpConfig};
use crate::prev_week::{MessageHistory, PrevWeekMessages};
use crate::rules::{emit_messages, PriorityIndex, RuleIndex};
use crate::weather::{self, WeatherTable};

/// Days a delivered CSV stays in the object store before the retention
/// sweep removes it.
pub const CSV_RETENTION_DAYS: i64 = 14;

/// How many days back the previous run's output is searched for stage
/// carry-over.
const PREV_RUN_LOOKBACK_DAYS: i64 = 7;

/// Cooperative cancellation flag shared between the orchestrator and its
/// work units.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an active token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Work units observe it at their next boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True when cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Lifecycle of one pipeline request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Accepted, not started.
    Pending,
    /// Stages are executing.
    Running,
    /// All stages finished and outputs were delivered.
    Completed,
    /// The run was cancelled or a stage hit its deadline.
    Stopped,
}

impl RequestStatus {
    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// The stage finished.
    Success,
    /// The stage failed, was cancelled, or timed out.
    Failed,
}

/// Timing and row counts for one finished stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub stage: &'static str,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage ended.
    pub ended_at: DateTime<Utc>,
    /// Rows the stage produced or carried forward.
    pub rows_processed: usize,
    /// Outcome.
    pub status: StageStatus,
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Request identifier.
    pub request_id: RequestId,
    /// Processing date the run covered.
    pub request_date: NaiveDate,
    /// Final status.
    pub status: RequestStatus,
    /// Per-stage reports, in execution order.
    pub stages: Vec<StageReport>,
    /// Farm-level rows written to the output dataset.
    pub output_rows: usize,
    /// Output partitions written.
    pub partitions_written: Vec<OutputPartition>,
    /// Records flushed to the error log.
    pub error_records: usize,
    /// Object-store URI of the delivered CSV, when delivered there.
    pub csv_uri: Option<String>,
    /// Remote path of the CSV on the SFTP endpoint, when delivered there.
    pub sftp_path: Option<String>,
}

/// Everything a run needs from the outside.
pub struct PipelineEnv {
    /// Product storage: inputs, outputs, error log, CSV artifacts.
    pub backend: Arc<dyn StorageBackend>,
    /// Advisory catalogs for the run.
    pub catalogs: Arc<RunCatalogs>,
    /// Operator settings.
    pub settings: PipelineSettings,
    /// Object key of the wide weather snapshot.
    pub weather_path: String,
    /// Local filesystem root of the product storage, required by the CSV
    /// export's SQL engine. `None` disables the export.
    pub products_root: Option<PathBuf>,
    /// SFTP endpoint for CSV delivery, when configured.
    pub sftp: Option<SftpConfig>,
    /// Wall-clock deadline applied to each stage.
    pub stage_timeout: Option<Duration>,
}

/// The batch advisory pipeline.
pub struct DcasPipeline {
    env: PipelineEnv,
    metrics: PipelineMetrics,
}

/// Mutable state threaded through the stages of one run.
struct RunState {
    request_id: RequestId,
    request_date: NaiveDate,
    stages: Vec<StageReport>,
    error_log: ErrorLog,
    temp_dir: PathBuf,
}

impl DcasPipeline {
    /// Creates a pipeline over its environment.
    #[must_use]
    pub fn new(env: PipelineEnv) -> Self {
        Self {
            env,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Executes one run. Cancellation and stage deadlines finish the run
    /// with status `STOPPED`; anything else fatal is returned as an error.
    ///
    /// # Errors
    /// Returns an error when a stage fails for a reason other than
    /// cancellation or a deadline.
    pub async fn run(&self, cancel: &CancelToken) -> Result<RunSummary> {
        let request_id = RequestId::generate();
        let request_date = self
            .env
            .settings
            .request_date(Utc::now().date_naive());
        let span = pipeline_span(&request_id.to_string(), &request_date.to_string());
        self.run_inner(cancel, request_id, request_date)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        cancel: &CancelToken,
        request_id: RequestId,
        request_date: NaiveDate,
    ) -> Result<RunSummary> {
        info!(status = %RequestStatus::Pending, "request accepted");
        let temp_dir = std::env::temp_dir()
            .join("dcas")
            .join(request_id.to_string());
        let mut state = RunState {
            request_id,
            request_date,
            stages: Vec::new(),
            error_log: ErrorLog::new(),
            temp_dir,
        };
        tokio::fs::create_dir_all(&state.temp_dir)
            .await
            .map_err(|e| dcas_core::error::Error::storage("create temp dir failed", e))?;
        info!(status = %RequestStatus::Running, "request started");

        let result = self.execute(cancel, &mut state).await;

        if let Err(e) = tokio::fs::remove_dir_all(&state.temp_dir).await {
            warn!(error = %e, "temp dir cleanup failed");
        }

        let summary = match result {
            Ok(mut summary) => {
                summary.status = RequestStatus::Completed;
                summary
            }
            Err(PipelineError::Cancelled) | Err(PipelineError::StageTimeout { .. }) => {
                RunSummary {
                    request_id: state.request_id,
                    request_date: state.request_date,
                    status: RequestStatus::Stopped,
                    stages: state.stages,
                    output_rows: 0,
                    partitions_written: Vec::new(),
                    error_records: state.error_log.len(),
                    csv_uri: None,
                    sftp_path: None,
                }
            }
            Err(e) => return Err(e),
        };
        self.metrics.record_run(summary.status.as_str());
        info!(status = %summary.status, stages = summary.stages.len(), "request finished");
        Ok(summary)
    }

    async fn execute(&self, cancel: &CancelToken, state: &mut RunState) -> Result<RunSummary> {
        let backend = self.env.backend.as_ref();
        let catalogs = Arc::clone(&self.env.catalogs);
        let request_date = state.request_date;

        // Inputs: registry snapshots and the weather table.
        let (farms, weather) = self
            .stage(cancel, state, "setup", async {
                let farms = self.load_registries().await?;
                let weather_bytes = backend.get(&self.env.weather_path).await?;
                let weather = Arc::new(WeatherTable::from_parquet(&weather_bytes)?);
                let rows = farms.len();
                Ok(((farms, weather), rows))
            })
            .await?;
        let epoch_list = Arc::new(
            if weather.epoch_list.is_empty() {
                earliest_epochs(&farms, request_date)
            } else {
                weather.epoch_list.clone()
            },
        );
        // Registry groups in this run; prior-output joins are scoped to them.
        let registries: HashSet<u32> = farms.iter().map(|f| f.registry_id).collect();

        // Grid-crop working set with previous-run stage carry-over.
        let mut rows = self
            .stage(cancel, state, "grid_crop", async {
                let prev_state = self.load_prev_state(request_date).await?;
                let rows = grid_crop::build(&farms, &catalogs, &prev_state)?;
                let count = rows.len();
                Ok((rows, count))
            })
            .await?;

        // Weather features: cumulative GDD, precipitation, scalars.
        rows = {
            let catalogs = Arc::clone(&catalogs);
            let weather = Arc::clone(&weather);
            let partitions = self.env.settings.grid_crop_num_partitions;
            let rows = self
                .map_chunks(cancel, state, "gdd", partitions, rows, move |row| {
                    let (base, cap) = catalogs
                        .gdd_bounds(row.crop_id, row.crop_stage_type_id, row.config_id)
                        .map_err(|_| PipelineError::MissingGddConfig {
                            crop_id: row.crop_id,
                            crop_stage_type_id: row.crop_stage_type_id,
                            config_id: row.config_id,
                        })?;
                    weather::apply_gdd(row, &weather, base, cap);
                    Ok(())
                })
                .await?;
            self.drain_failures(state, &farms, rows, |row| {
                row.total_gdd
                    .is_none()
                    .then(|| "no usable weather for the grid".to_string())
            })
        };

        // Growth stage resolution and stage-scoped precipitation.
        rows = {
            let cache = Arc::new(GrowthStageMatrixCache::preload(&catalogs));
            let weather = Arc::clone(&weather);
            let epochs = Arc::clone(&epoch_list);
            let partitions = self.env.settings.grid_crop_num_partitions;
            let rows = self
                .map_chunks(cancel, state, "growth_stage", partitions, rows, move |row| {
                    growth_stage::apply(row, &cache, &epochs);
                    weather::apply_growth_stage_precipitation(row, &weather);
                    Ok(())
                })
                .await?;
            self.drain_failures(state, &farms, rows, |row| {
                row.growth_stage_id
                    .is_none()
                    .then(|| "growth stage could not be resolved".to_string())
            })
        };

        // Messages: previous-week dedup, rule evaluation, final selection.
        rows = {
            let prev = self
                .stage(cancel, state, "prev_week", async {
                    let prev = PrevWeekMessages::load(backend, request_date, &registries).await?;
                    Ok((prev, 0))
                })
                .await?;
            let rule_index = Arc::new(RuleIndex::preload(&catalogs));
            let priority_index = Arc::new(PriorityIndex::preload(&catalogs));
            let partitions = self.env.settings.grid_crop_num_partitions;
            self.map_chunks(cancel, state, "messages", partitions, rows, move |row| {
                row.prev_week_message = prev.get(&row.key());
                let mut fired = rule_index.evaluate(row);
                priority_index.sort(row.config_id, &mut fired);
                emit_messages(row, &fired);
                Ok(())
            })
            .await?
        };
        self.log_message_anomalies(state, &farms, &rows);

        // Stage the intermediate table locally for post-run inspection.
        let table_bytes = grid_crop::to_parquet(&rows, &epoch_list)?;
        tokio::fs::write(state.temp_dir.join("grid_crop.parquet"), &table_bytes)
            .await
            .map_err(|e| dcas_core::error::Error::storage("stage intermediate table failed", e))?;

        // Fan-out to farm-level rows, split by the farm partition count.
        let farm_partitions = self.env.settings.farm_num_partitions.max(1);
        let mut output_rows = self
            .stage(cancel, state, "fan_out", async {
                let results: Arc<HashMap<GridCropKey, GridCropRow>> =
                    Arc::new(rows.iter().map(|r| (r.key(), r.clone())).collect());
                let chunk_size = farms.len().div_ceil(farm_partitions).max(1);
                let mut handles: Vec<JoinHandle<Result<Vec<FarmOutputRow>>>> = Vec::new();
                let mut farms = farms;
                while !farms.is_empty() {
                    let mut chunk = farms;
                    farms = chunk.split_off(chunk.len().min(chunk_size));
                    let results = Arc::clone(&results);
                    let catalogs = Arc::clone(&catalogs);
                    let cancel = cancel.clone();
                    handles.push(tokio::task::spawn_blocking(move || {
                        cancel.check()?;
                        Ok(farm::fan_out(&chunk, &results, &catalogs, request_date))
                    }));
                }

                let mut out = Vec::new();
                for chunk in try_join_all(handles)
                    .await
                    .map_err(|e| PipelineError::Join {
                        message: e.to_string(),
                    })?
                {
                    out.extend(chunk?);
                }
                let count = out.len();
                Ok((out, count))
            })
            .await?;

        // Optional multi-week suppression over the loaded history window.
        if let Some(weeks) = self.env.settings.weeks_constraint {
            let history = self
                .stage(cancel, state, "message_history", async {
                    let history =
                        MessageHistory::load(backend, request_date, weeks, &registries).await?;
                    let codes = history.len();
                    Ok((Arc::new(history), codes))
                })
                .await?;
            let suppressed = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&suppressed);
            output_rows = self
                .map_chunks(cancel, state, "suppression", farm_partitions, output_rows, move |row| {
                    counter.fetch_add(history.suppress_row(row), Ordering::Relaxed);
                    Ok(())
                })
                .await?;
            info!(
                suppressed = suppressed.load(Ordering::Relaxed),
                "multi-week suppression applied"
            );
        }

        // Partitioned parquet write.
        let partitions = self
            .stage(cancel, state, "output", async {
                let partitions = output::write_partitions(backend, &output_rows).await?;
                let count = partitions.len();
                Ok((partitions, count))
            })
            .await?;
        self.metrics.record_output_partitions(partitions.len());

        // CSV export, delivery, and the retention sweep.
        let (csv_uri, sftp_path) = self
            .stage(cancel, state, "csv_export", async {
                let delivered = self.export_csv(request_date).await?;
                Ok((delivered, 0))
            })
            .await?;

        let error_records = state.error_log.len();
        state.error_log.persist(backend, &state.request_id).await?;

        Ok(RunSummary {
            request_id: state.request_id.clone(),
            request_date,
            status: RequestStatus::Running,
            stages: std::mem::take(&mut state.stages),
            output_rows: output_rows.len(),
            partitions_written: partitions,
            error_records,
            csv_uri,
            sftp_path,
        })
    }

    /// Runs one stage under the cancel token, the stage deadline, a tracing
    /// span, and a metrics timer, and records its report.
    async fn stage<F, T>(
        &self,
        cancel: &CancelToken,
        state: &mut RunState,
        name: &'static str,
        fut: F,
    ) -> Result<T>
    where
        F: std::future::Future<Output = Result<(T, usize)>>,
    {
        cancel.check()?;
        let span = stage_span(name, &state.request_id.to_string());
        let fut = fut.instrument(span);
        let timer = StageTimer::start(&self.metrics, name);
        let started_at = Utc::now();

        let result = match self.env.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::StageTimeout {
                    stage: name.to_string(),
                }),
            },
            None => fut.await,
        };
        drop(timer);

        let (status, rows_processed) = match &result {
            Ok((_, rows)) => (StageStatus::Success, *rows),
            Err(_) => (StageStatus::Failed, 0),
        };
        state.stages.push(StageReport {
            stage: name,
            started_at,
            ended_at: Utc::now(),
            rows_processed,
            status,
        });
        if status == StageStatus::Success {
            self.metrics.record_rows(name, rows_processed);
            info!(stage = name, rows = rows_processed, "stage finished");
        }
        result.map(|(value, _)| value)
    }

    /// Applies `f` to every row, split into `partitions` chunks on blocking
    /// tasks. Row order is preserved; cancellation is observed at each chunk
    /// boundary.
    async fn map_chunks<T, F>(
        &self,
        cancel: &CancelToken,
        state: &mut RunState,
        name: &'static str,
        partitions: usize,
        rows: Vec<T>,
        f: F,
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&mut T) -> Result<()> + Send + Sync + 'static,
    {
        let partitions = partitions.max(1);
        let f = Arc::new(f);
        self.stage(cancel, state, name, async {
            let total = rows.len();
            let chunk_size = total.div_ceil(partitions).max(1);
            let mut handles: Vec<JoinHandle<Result<Vec<T>>>> = Vec::new();
            let mut rows = rows;
            while !rows.is_empty() {
                let mut chunk = rows;
                rows = chunk.split_off(chunk.len().min(chunk_size));
                let f = Arc::clone(&f);
                let cancel = cancel.clone();
                handles.push(tokio::task::spawn_blocking(move || {
                    cancel.check()?;
                    for row in &mut chunk {
                        f(row)?;
                    }
                    Ok(chunk)
                }));
            }

            let mut out = Vec::with_capacity(total);
            for chunk in try_join_all(handles)
                .await
                .map_err(|e| PipelineError::Join {
                    message: e.to_string(),
                })?
            {
                out.extend(chunk?);
            }
            Ok((out, total))
        })
        .await
    }

    async fn load_registries(&self) -> Result<Vec<FarmRecord>> {
        let mut farms = Vec::new();
        for (idx, path) in self.env.settings.farm_registries.iter().enumerate() {
            let bytes = self.env.backend.get(path).await?;
            let registry = farm::read_registry(&bytes, idx as u32 + 1)?;
            info!(registry = %path, farms = registry.len(), "loaded farm registry");
            farms.extend(registry);
        }
        Ok(farms)
    }

    /// Finds the most recent output within the lookback window and lifts its
    /// growth-stage state. No prior output means a cold start.
    async fn load_prev_state(
        &self,
        request_date: NaiveDate,
    ) -> Result<HashMap<GridCropKey, PrevStageState>> {
        for offset in 1..=PREV_RUN_LOOKBACK_DAYS {
            let date = request_date - chrono::Duration::days(offset);
            let records = output::load_rows_for_date(self.env.backend.as_ref(), date).await?;
            if records.is_empty() {
                continue;
            }
            let mut prev = HashMap::new();
            for record in records {
                if let (Some(stage), Some(start)) =
                    (record.growth_stage_id, record.growth_stage_start_date)
                {
                    prev.insert(
                        record.key(),
                        PrevStageState {
                            growth_stage_id: stage,
                            growth_stage_start_date: start,
                        },
                    );
                }
            }
            info!(prev_date = %date, keys = prev.len(), "carried previous run state");
            return Ok(prev);
        }
        Ok(HashMap::new())
    }

    /// Splits off rows failing `check`, logging a `PROCESSING_FAILURE` per
    /// affected farm, and returns the surviving rows.
    fn drain_failures(
        &self,
        state: &mut RunState,
        farms: &[FarmRecord],
        rows: Vec<GridCropRow>,
        check: impl Fn(&GridCropRow) -> Option<String>,
    ) -> Vec<GridCropRow> {
        let mut failed: HashMap<GridCropKey, String> = HashMap::new();
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            match check(&row) {
                Some(reason) => {
                    failed.insert(row.key(), reason);
                }
                None => kept.push(row),
            }
        }
        if failed.is_empty() {
            return kept;
        }

        for farm in farms {
            let key = farm.grid_crop_key();
            if let Some(reason) = failed.get(&key) {
                state.error_log.push(
                    farm.farm_id,
                    key.canonical(),
                    ErrorKind::ProcessingFailure,
                    reason.clone(),
                    None,
                );
                self.metrics
                    .record_row_error(ErrorKind::ProcessingFailure.as_str());
            }
        }
        warn!(dropped = failed.len(), "rows dropped to the error log");
        kept
    }

    /// Logs `MISSING_MESSAGES` and `FOUND_REPETITIVE` rows. Neither drops
    /// the row from the output.
    fn log_message_anomalies(
        &self,
        state: &mut RunState,
        farms: &[FarmRecord],
        rows: &[GridCropRow],
    ) {
        let mut anomalies: HashMap<GridCropKey, (&GridCropRow, ErrorKind)> = HashMap::new();
        for row in rows {
            if row.is_empty_message {
                anomalies.insert(row.key(), (row, ErrorKind::MissingMessages));
            } else if row.has_repetitive_message {
                anomalies.insert(row.key(), (row, ErrorKind::FoundRepetitive));
            }
        }
        if anomalies.is_empty() {
            return;
        }

        for farm in farms {
            let key = farm.grid_crop_key();
            let Some((row, kind)) = anomalies.get(&key) else {
                continue;
            };
            let parameters = serde_json::json!({
                "growth_stage_id": row.growth_stage_id,
                "total_gdd": row.total_gdd,
                "temperature": row.temperature,
                "humidity": row.humidity,
                "p_pet": row.p_pet,
                "growth_stage_precipitation": row.growth_stage_precipitation,
                "seasonal_precipitation": row.seasonal_precipitation,
                "prev_week_message": row.prev_week_message,
            })
            .to_string();
            let message = match kind {
                ErrorKind::MissingMessages => "no rule fired for the row",
                ErrorKind::FoundRepetitive => {
                    "top candidate repeated last week's message, fallback applied"
                }
                _ => unreachable!(),
            };
            state
                .error_log
                .push(farm.farm_id, key.canonical(), *kind, message, Some(parameters));
            self.metrics.record_row_error(kind.as_str());
        }
    }

    /// Exports and delivers the CSV when either delivery target is enabled.
    async fn export_csv(
        &self,
        request_date: NaiveDate,
    ) -> Result<(Option<String>, Option<String>)> {
        let settings = &self.env.settings;
        if !settings.store_csv_to_minio && !settings.store_csv_to_sftp {
            return Ok((None, None));
        }
        let Some(root) = self.env.products_root.as_deref() else {
            return Err(dcas_core::error::Error::Config(
                "CSV delivery is enabled but no local products root is configured".into(),
            )
            .into());
        };

        let options = CsvExportOptions {
            num_threads: settings.duck_db_num_threads,
            memory_limit: settings.memory_limit_bytes()?,
            ..CsvExportOptions::default()
        };
        let exporter = CsvExporter::new(Arc::clone(&self.env.catalogs), options);
        let (filename, data) = exporter.export(root, request_date).await?;

        let csv_uri = if settings.store_csv_to_minio {
            Some(output::deliver_to_store(self.env.backend.as_ref(), &filename, data.clone()).await?)
        } else {
            None
        };
        let sftp_path = if settings.store_csv_to_sftp {
            let Some(config) = self.env.sftp.clone() else {
                return Err(dcas_core::error::Error::Config(
                    "SFTP delivery is enabled but no endpoint is configured".into(),
                )
                .into());
            };
            let remote = tokio::task::spawn_blocking(move || {
                output::deliver_to_sftp(&config, &filename, &data)
            })
            .await
            .map_err(|e| PipelineError::Join {
                message: e.to_string(),
            })??;
            Some(remote)
        } else {
            None
        };

        output::sweep_expired_csv(self.env.backend.as_ref(), Utc::now(), CSV_RETENTION_DAYS)
            .await?;
        Ok((csv_uri, sftp_path))
    }
}

/// Builds a daily epoch list from the earliest planting date up to the
/// processing date. Used when the weather snapshot carries no series.
fn earliest_epochs(farms: &[FarmRecord], request_date: NaiveDate) -> Vec<i64> {
    let keys: HashSet<i64> = farms
        .iter()
        .map(|f| f.grid_crop_key().planting_date_epoch)
        .collect();
    match keys
        .iter()
        .min()
        .copied()
        .and_then(|e| epoch_to_date(e).ok())
    {
        Some(earliest) => daily_epochs(earliest, request_date),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(PipelineError::Cancelled)));

        // Clones observe the same flag.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn status_strings_are_screaming_snake() {
        assert_eq!(RequestStatus::Pending.as_str(), "PENDING");
        assert_eq!(RequestStatus::Running.as_str(), "RUNNING");
        assert_eq!(RequestStatus::Completed.as_str(), "COMPLETED");
        assert_eq!(RequestStatus::Stopped.as_str(), "STOPPED");
        assert_eq!(
            serde_json::to_string(&RequestStatus::Stopped).unwrap(),
            "\"STOPPED\""
        );
    }

    #[test]
    fn epoch_fallback_spans_earliest_planting() {
        let farm = FarmRecord {
            farm_id: 1,
            farm_unique_id: "F-1".into(),
            registry_id: 1,
            grid_id: 7,
            grid_unique_id: None,
            crop_id: 3,
            crop_stage_type_id: 1,
            planting_date: NaiveDate::from_ymd_opt(2025, 1, 9).unwrap(),
            iso_a3: "KEN".into(),
            county: None,
            subcounty: None,
            ward: None,
            preferred_language: None,
            longitude: None,
            latitude: None,
        };
        let epochs = earliest_epochs(&[farm], NaiveDate::from_ymd_opt(2025, 1, 12).unwrap());
        assert_eq!(epochs.len(), 4);
        assert!(earliest_epochs(&[], NaiveDate::from_ymd_opt(2025, 1, 12).unwrap()).is_empty());
    }
}
