//! # dcas-pipeline
//!
//! Data plane of the DCAS advisory pipeline.
//!
//! One run takes a farm registry snapshot, a per-grid weather snapshot, and
//! the advisory catalogs, and produces a hive-partitioned parquet dataset
//! plus a delivered CSV. The stages:
//!
//! 1. **Grid-crop build** ([`grid_crop`]): distinct (grid, crop, stage-type,
//!    planting-date) tuples with previous-run state carried forward.
//! 2. **Weather features** ([`weather`]): daily and cumulative GDD, seasonal
//!    precipitation, pass-through scalars.
//! 3. **Growth stage** ([`growth_stage`]): cumulative GDD resolved against
//!    the GDD matrix, stage start date inferred.
//! 4. **Messages** ([`rules`]): rule evaluation, priority ordering, final
//!    message selection with previous-week dedup ([`prev_week`]).
//! 5. **Farm fan-out** ([`farm`]): grid-crop results expanded per farm.
//! 6. **Output** ([`output`]): partitioned parquet write, CSV projection via
//!    DataFusion, object-store/SFTP delivery.
//!
//! The [`pipeline`] module sequences the stages, chunks work units onto
//! blocking tasks, and records per-stage progress. Row-level failures land in
//! the [`error_log`] instead of aborting the run.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod error;
pub mod error_log;
pub mod farm;
pub mod grid_crop;
pub mod growth_stage;
pub mod metrics;
pub mod output;
pub(crate) mod parquet_util;
pub mod pipeline;
pub mod prev_week;
pub mod rules;
pub mod weather;

pub use error::{PipelineError, Result};
pub use pipeline::{CancelToken, DcasPipeline, PipelineEnv, RequestStatus, RunSummary};
