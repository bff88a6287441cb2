//! Observability infrastructure for the DCAS pipeline.
//!
//! Structured logging with consistent spans: every stage runs under a
//! `stage` span carrying the request id, so log lines from concurrent work
//! units can be attributed to their run.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `dcas_pipeline=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one pipeline stage within a request.
#[must_use]
pub fn stage_span(stage: &str, request_id: &str) -> Span {
    tracing::info_span!("stage", stage = stage, request_id = request_id)
}

/// Creates a span covering a whole pipeline run.
#[must_use]
pub fn pipeline_span(request_id: &str, request_date: &str) -> Span {
    tracing::info_span!(
        "pipeline",
        request_id = request_id,
        request_date = request_date,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn stage_span_carries_fields() {
        let span = stage_span("gdd", "req_test");
        let _guard = span.enter();
        tracing::info!("message in stage span");
    }
}
