//! Stage-level pipeline errors.
//!
//! Row-level problems go to the error log and do not surface here; these
//! variants are the fatal conditions that stop a stage and mark the request
//! `STOPPED`.

/// The result type used throughout the pipeline crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that abort a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A core operation failed (storage, config, identifiers).
    #[error(transparent)]
    Core(#[from] dcas_core::error::Error),

    /// A parquet encode or decode failed.
    #[error("parquet error: {message}")]
    Parquet {
        /// Description of the parquet failure.
        message: String,
    },

    /// The SQL engine rejected a query or plan.
    #[error("sql engine error: {message}")]
    Sql {
        /// Description of the engine failure.
        message: String,
    },

    /// SFTP delivery failed.
    #[error("sftp delivery error: {message}")]
    Sftp {
        /// Description of the transfer failure.
        message: String,
    },

    /// No GDD base/cap configuration exists for a grid-crop key.
    #[error("missing GDD config for crop {crop_id} stage type {crop_stage_type_id} config {config_id}")]
    MissingGddConfig {
        /// Crop identifier.
        crop_id: u32,
        /// Crop stage type identifier.
        crop_stage_type_id: u32,
        /// DCAS configuration identifier.
        config_id: u32,
    },

    /// No DCAS configuration is mapped for a country in the registry.
    #[error("no DCAS config mapped for country {country}")]
    MissingConfigMapping {
        /// ISO A3 country code.
        country: String,
    },

    /// The run was cancelled at a work-unit boundary.
    #[error("run cancelled")]
    Cancelled,

    /// A stage exceeded its wall-clock deadline.
    #[error("stage {stage} exceeded its deadline")]
    StageTimeout {
        /// Name of the stage that timed out.
        stage: String,
    },

    /// A blocking work unit panicked or was aborted.
    #[error("work unit failed to join: {message}")]
    Join {
        /// Description of the join failure.
        message: String,
    },
}

impl PipelineError {
    /// Creates a parquet error from any displayable cause.
    pub fn parquet(message: impl std::fmt::Display) -> Self {
        Self::Parquet {
            message: message.to_string(),
        }
    }

    /// Creates a SQL engine error from any displayable cause.
    pub fn sql(message: impl std::fmt::Display) -> Self {
        Self::Sql {
            message: message.to_string(),
        }
    }

    /// Creates an SFTP error from any displayable cause.
    pub fn sftp(message: impl std::fmt::Display) -> Self {
        Self::Sftp {
            message: message.to_string(),
        }
    }
}
