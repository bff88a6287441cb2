//! Observability metrics for the advisory pipeline.
//!
//! Metrics are exposed via the `metrics` crate facade; an exporter is
//! installed by the binary, not here.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `dcas_pipeline_runs_total` | Counter | `status` | Pipeline runs by final status |
//! | `dcas_pipeline_rows_processed_total` | Counter | `stage` | Rows processed per stage |
//! | `dcas_pipeline_row_errors_total` | Counter | `error_type` | Error-log records by kind |
//! | `dcas_pipeline_stage_duration_seconds` | Histogram | `stage` | Wall time per stage |
//! | `dcas_pipeline_output_partitions_total` | Counter | - | Output partitions written |

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Pipeline runs by final status.
    pub const RUNS_TOTAL: &str = "dcas_pipeline_runs_total";
    /// Counter: Rows processed per stage.
    pub const ROWS_PROCESSED_TOTAL: &str = "dcas_pipeline_rows_processed_total";
    /// Counter: Error-log records by kind.
    pub const ROW_ERRORS_TOTAL: &str = "dcas_pipeline_row_errors_total";
    /// Histogram: Wall time per stage in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "dcas_pipeline_stage_duration_seconds";
    /// Counter: Output partitions written.
    pub const OUTPUT_PARTITIONS_TOTAL: &str = "dcas_pipeline_output_partitions_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Pipeline stage name.
    pub const STAGE: &str = "stage";
    /// Final run status.
    pub const STATUS: &str = "status";
    /// Error-log record kind.
    pub const ERROR_TYPE: &str = "error_type";
}

/// High-level interface for recording pipeline metrics. Cheap to clone and
/// share across tasks.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    _private: (),
}

impl PipelineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed run with its final status.
    pub fn record_run(&self, status: &str) {
        counter!(
            names::RUNS_TOTAL,
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records rows processed by a stage.
    pub fn record_rows(&self, stage: &str, rows: usize) {
        counter!(
            names::ROWS_PROCESSED_TOTAL,
            labels::STAGE => stage.to_string(),
        )
        .increment(rows as u64);
    }

    /// Records an error-log record by kind.
    pub fn record_row_error(&self, error_type: &str) {
        counter!(
            names::ROW_ERRORS_TOTAL,
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    /// Records a stage's wall time.
    pub fn observe_stage_duration(&self, stage: &str, duration: Duration) {
        histogram!(
            names::STAGE_DURATION_SECONDS,
            labels::STAGE => stage.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records output partitions written.
    pub fn record_output_partitions(&self, count: usize) {
        counter!(names::OUTPUT_PARTITIONS_TOTAL).increment(count as u64);
    }
}

/// RAII guard for timing a stage; records duration when dropped.
pub struct StageTimer {
    metrics: PipelineMetrics,
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    /// Starts timing a stage.
    #[must_use]
    pub fn start(metrics: &PipelineMetrics, stage: &'static str) -> Self {
        Self {
            metrics: metrics.clone(),
            stage,
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time since the timer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.metrics
            .observe_stage_duration(self.stage, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_exporter_is_a_noop() {
        let metrics = PipelineMetrics::new();
        metrics.record_run("COMPLETED");
        metrics.record_rows("grid_crop", 10);
        metrics.record_row_error("MISSING_MESSAGES");
        metrics.record_output_partitions(2);
        let timer = StageTimer::start(&metrics, "weather");
        assert!(timer.elapsed() < Duration::from_secs(1));
    }
}
