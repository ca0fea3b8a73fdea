//! Progress reporting for environment conversions.
//!
//! Provides [`ConversionPhase`] events covering the lifecycle of a single
//! conversion (target check, inventory, base creation, batched installs,
//! verification) and a [`ProgressHandler`] trait that consumers implement to
//! route events to their UI layer.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Progress phases during one source -> target conversion.
///
/// Serializable so the CLI can stream them as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ConversionPhase {
    /// Starting conversion.
    Starting { source: String, target: String },
    /// The target name was checked against existing environments.
    TargetChecked { exists: bool },
    /// Packages were extracted from the source.
    Inventoried {
        conda_count: usize,
        pip_count: usize,
        explicit_only: bool,
    },
    /// Creating the target with python only.
    CreatingBase { python: Option<String> },
    /// Installing one batch of packages.
    InstallingBatch {
        origin: String,
        batch: usize,
        total_batches: usize,
        size: usize,
    },
    /// A batch failed and is being retried one package at a time.
    BatchFallback { origin: String, batch: usize },
    /// A single package could not be installed.
    PackageFailed {
        package: String,
        origin: String,
        reason: String,
    },
    /// Ownership of the target was matched to the source.
    OwnershipPreserved { uid: u32, gid: u32 },
    /// Dry run: nothing was created.
    DryRun {
        conda_packages: Vec<String>,
        pip_packages: Vec<String>,
    },
    /// The target environment exists after conversion.
    Verified { target: String },
    /// The conversion failed.
    Failed { message: String },
}

/// Trait for receiving conversion progress events.
///
/// Implementations are shared across the batch worker pool.
pub trait ProgressHandler: Send + Sync {
    /// Called for each phase. `env` is the source environment name.
    fn on_progress(&self, env: &str, phase: ConversionPhase);
}

/// Log-only progress handler.
///
/// Writes phases to the `log` crate, mostly at info level.
pub struct LogHandler;

impl ProgressHandler for LogHandler {
    fn on_progress(&self, env: &str, phase: ConversionPhase) {
        match &phase {
            ConversionPhase::Starting { source, target } => {
                log::info!("[{env}] Converting {source} -> {target}");
            }
            ConversionPhase::TargetChecked { exists } => {
                log::debug!("[{env}] Target exists: {exists}");
            }
            ConversionPhase::Inventoried {
                conda_count,
                pip_count,
                explicit_only,
            } => {
                let kind = if *explicit_only { "explicit" } else { "full export" };
                log::info!("[{env}] Found {conda_count} conda and {pip_count} pip packages ({kind})");
            }
            ConversionPhase::CreatingBase { python } => match python {
                Some(v) => log::info!("[{env}] Creating base environment with python {v}"),
                None => log::info!("[{env}] Creating base environment"),
            },
            ConversionPhase::InstallingBatch {
                origin,
                batch,
                total_batches,
                size,
            } => {
                log::info!("[{env}] Installing {origin} batch {batch}/{total_batches} ({size} packages)");
            }
            ConversionPhase::BatchFallback { origin, batch } => {
                log::warn!("[{env}] {origin} batch {batch} failed, retrying packages individually");
            }
            ConversionPhase::PackageFailed {
                package,
                origin,
                reason,
            } => {
                log::warn!("[{env}] Could not install {origin} package {package}: {reason}");
            }
            ConversionPhase::OwnershipPreserved { uid, gid } => {
                log::info!("[{env}] Set ownership to {uid}:{gid}");
            }
            ConversionPhase::DryRun {
                conda_packages,
                pip_packages,
            } => {
                log::info!(
                    "[{env}] Dry run: would install {} conda and {} pip packages",
                    conda_packages.len(),
                    pip_packages.len()
                );
            }
            ConversionPhase::Verified { target } => {
                log::info!("[{env}] Verified {target}");
            }
            ConversionPhase::Failed { message } => {
                log::error!("[{env}] Error: {message}");
            }
        }
    }
}

/// Handler that discards every event.
pub struct NullHandler;

impl ProgressHandler for NullHandler {
    fn on_progress(&self, _env: &str, _phase: ConversionPhase) {}
}

/// Handler that keeps every event in memory, in arrival order.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<(String, ConversionPhase)>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, ConversionPhase)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Phases reported for one environment.
    pub fn phases_for(&self, env: &str) -> Vec<ConversionPhase> {
        self.events()
            .into_iter()
            .filter(|(name, _)| name == env)
            .map(|(_, phase)| phase)
            .collect()
    }
}

impl ProgressHandler for RecordingHandler {
    fn on_progress(&self, env: &str, phase: ConversionPhase) {
        if let Ok(mut events) = self.events.lock() {
            events.push((env.to_string(), phase));
        }
    }
}
