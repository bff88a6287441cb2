//! # dcas-core
//!
//! Core abstractions for the DCAS advisory pipeline.
//!
//! This crate provides the foundational types shared by the pipeline stages:
//!
//! - **Identifiers**: strongly-typed request ids and grid-crop keys
//! - **Catalogs**: crop, growth-stage, GDD, rule, and priority entities
//! - **Partitions**: hive-style output partition addressing
//! - **Storage**: abstract object-storage backend with memory and local-fs
//!   implementations
//! - **Configuration**: the recognized pipeline settings
//! - **Error Types**: shared error definitions and result alias
//!
//! ## Crate Boundary
//!
//! `dcas-core` is the only crate allowed to define shared primitives. The
//! pipeline stages in `dcas-pipeline` build on the contracts defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod keys;
pub mod observability;
pub mod partition;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::catalog::{
        Crop, CropStageType, GddConfig, GddMatrixEntry, GrowthStage, MessagePriority,
        MessageTemplate, Parameter, Rule, RunCatalogs,
    };
    pub use crate::config::PipelineSettings;
    pub use crate::error::{Error, Result};
    pub use crate::keys::{date_to_epoch, epoch_to_date, GridCropKey, RequestId};
    pub use crate::partition::{OutputPartition, DCAS_OUTPUT_DIR};
    pub use crate::storage::{LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend};
}
