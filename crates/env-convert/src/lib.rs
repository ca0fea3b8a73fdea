//! Conda environment conversion, drift tracking, and incremental updates.
//!
//! This crate reconciles existing conda environments against a target channel
//! (conda-forge by default). It includes:
//!
//! - Environment discovery from the package manager registry and the filesystem
//! - Package extraction and normalization of `environment.yml` style dependency lists
//! - A staged conversion engine with batched installs and per-package fallback
//! - A bounded-parallel batch orchestrator with disk-space preflight and backups
//! - Drift comparison between a source environment and its converted counterpart
//! - A TTL metadata cache for channel lookups
//!
//! The package manager itself (`conda` or `mamba`) is driven as an external
//! process through the [`runner::CondaRunner`] seam, so every component can be
//! exercised against an in-memory fake.
//!
//! ```ignore
//! use std::sync::Arc;
//! use env_convert::{conda::CondaCli, convert::{Converter, ConversionOptions}};
//! use env_convert::progress::LogHandler;
//! use env_convert::runner::ProcessRunner;
//!
//! let conda = CondaCli::new(Arc::new(ProcessRunner::detect()?));
//! let converter = Converter::new(conda, ConversionOptions::default(), Arc::new(LogHandler));
//! let report = converter.convert("myenv", "myenv_forge");
//! ```

use std::path::PathBuf;

pub mod batch;
pub mod cache;
pub mod conda;
pub mod convert;
pub mod drift;
pub mod inventory;
pub mod package_spec;
pub mod progress;
pub mod report;
pub mod runner;
pub mod settings;
pub mod update;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchError, BatchOptions, BatchOrchestrator, BatchSummary};
pub use cache::MetadataCache;
pub use conda::CondaCli;
pub use convert::{ConversionOptions, ConversionResult, Converter, Outcome};
pub use drift::{DriftError, DriftReport};
pub use inventory::{EnvironmentInfo, EnvironmentRecord, Inventory};
pub use package_spec::{DependencyEntry, PackageOrigin, PackageSpec};
pub use settings::Settings;

/// Base directory for everything this tool keeps between runs.
///
/// `~/.cache/conda-convert/` on Linux.
pub fn base_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("conda-convert")
}

/// Get the default directory for the metadata cache.
pub fn default_cache_dir() -> PathBuf {
    base_cache_dir().join("metadata")
}

/// Get the default root for batch backup directories.
pub fn default_backup_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conda-convert")
        .join("backups")
}
