//! Converting many environments at once.
//!
//! [`BatchOrchestrator::convert_many`] selects environments by glob, skips
//! the ones whose target already exists, checks that the disk can take the
//! new environments, writes a declarative backup of each one, and then runs
//! the [`Converter`] over them with bounded parallelism.
//!
//! Each conversion is blocking work on the tokio blocking pool. Every
//! environment gets its own result slot; slots are merged once every worker
//! has finished, so no lock is shared between workers.

use std::collections::BTreeMap;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::conda::EnvTarget;
use crate::convert::{ConversionReport, ConversionResult, Converter, Outcome};

/// Default suffix appended to converted environment names.
pub const DEFAULT_TARGET_SUFFIX: &str = "_forge";

/// Default disk estimate per package.
pub const DEFAULT_MB_PER_PACKAGE: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("aborted: conversion needs about {required_mb} MB but only {available_mb} MB is free")]
    Aborted { required_mb: u64, available_mb: u64 },

    #[error("could not write backups to {path:?}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Asks the operator whether to continue despite a problem.
pub trait ConfirmationGate: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> ConfirmationGate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Prompts on the terminal; answers no when stdin is not interactive.
pub struct TerminalPrompt;

impl ConfirmationGate for TerminalPrompt {
    fn confirm(&self, prompt: &str) -> bool {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            warn!("[batch] Not interactive, declining: {}", prompt);
            return false;
        }

        let mut stderr = std::io::stderr();
        if write!(stderr, "{} [y/N] ", prompt).and_then(|_| stderr.flush()).is_err() {
            return false;
        }
        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Glob of environment names to include; all when `None`.
    pub pattern: Option<String>,
    /// Glob of environment names to leave out.
    pub exclude: Option<String>,
    pub target_suffix: String,
    pub backup_suffix: String,
    pub max_parallel: usize,
    /// Write a declarative spec of each environment before converting.
    pub backup: bool,
    pub backup_root: PathBuf,
    pub search_paths: Vec<PathBuf>,
    pub max_depth: usize,
    /// Skip the disk-space confirmation.
    pub assume_yes: bool,
    pub mb_per_package: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            pattern: None,
            exclude: None,
            target_suffix: DEFAULT_TARGET_SUFFIX.to_string(),
            backup_suffix: crate::convert::DEFAULT_BACKUP_SUFFIX.to_string(),
            max_parallel: 1,
            backup: true,
            backup_root: crate::default_backup_dir(),
            search_paths: Vec::new(),
            max_depth: 3,
            assume_yes: false,
            mb_per_package: DEFAULT_MB_PER_PACKAGE,
        }
    }
}

/// Outcome of a batch run, in environment-name order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub results: Vec<ConversionResult>,
    /// Detailed reports for the environments that were attempted.
    pub reports: Vec<ConversionReport>,
    pub backup_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl BatchSummary {
    /// Results with `outcome`, still in environment-name order.
    pub fn with_outcome(&self, outcome: Outcome) -> impl Iterator<Item = &ConversionResult> {
        self.results.iter().filter(move |r| r.outcome == outcome)
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.with_outcome(outcome).count()
    }

    pub fn success(&self) -> usize {
        self.count(Outcome::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    pub fn attempted(&self) -> usize {
        self.success() + self.failed()
    }

    /// True when at least one environment was attempted and none failed.
    pub fn succeeded(&self) -> bool {
        self.attempted() > 0 && self.failed() == 0
    }
}

/// One environment scheduled for conversion.
#[derive(Debug, Clone)]
struct Job {
    source: String,
    path: PathBuf,
    target: String,
}

impl Job {
    fn source_path(&self) -> Option<&Path> {
        (!self.path.as_os_str().is_empty()).then_some(self.path.as_path())
    }

    /// Prefer the discovered prefix; scan-only environments have no name the
    /// manager would recognize.
    fn env_target(&self) -> EnvTarget<'_> {
        match self.source_path() {
            Some(path) => EnvTarget::Prefix(path),
            None => EnvTarget::Name(&self.source),
        }
    }
}

/// Estimated disk use in MB: packages x MB-per-package x 1.2.
pub fn required_space_mb(package_count: usize, mb_per_package: u64) -> u64 {
    let raw = (package_count as u64).saturating_mul(mb_per_package);
    raw.saturating_mul(12).div_ceil(10)
}

/// Compare the estimate with free space, asking `gate` on a shortfall.
pub fn check_disk_space(
    required_mb: u64,
    available_mb: u64,
    assume_yes: bool,
    gate: &dyn ConfirmationGate,
) -> Result<(), BatchError> {
    if required_mb <= available_mb {
        return Ok(());
    }
    warn!(
        "[batch] Estimated {} MB needed, {} MB available",
        required_mb, available_mb
    );
    if assume_yes {
        return Ok(());
    }
    let prompt = format!(
        "Conversion may need {} MB but only {} MB is free. Continue?",
        required_mb, available_mb
    );
    if gate.confirm(&prompt) {
        Ok(())
    } else {
        Err(BatchError::Aborted {
            required_mb,
            available_mb,
        })
    }
}

/// Free space in MB on the filesystem holding `path` (or its nearest
/// existing ancestor).
fn available_space_mb(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists())?;
    match fs2::available_space(existing) {
        Ok(bytes) => Some(bytes / (1024 * 1024)),
        Err(e) => {
            warn!("[batch] Could not determine free space at {:?}: {}", existing, e);
            None
        }
    }
}

/// Environment names that pass the include/exclude globs and are not
/// themselves conversion targets or backups.
pub fn select_environments<'a>(
    names: impl IntoIterator<Item = &'a String>,
    pattern: Option<&str>,
    exclude: Option<&str>,
    target_suffix: &str,
    backup_suffix: &str,
) -> Result<Vec<String>, BatchError> {
    let compile = |p: &str| {
        glob::Pattern::new(p).map_err(|source| BatchError::InvalidPattern {
            pattern: p.to_string(),
            source,
        })
    };
    let include = pattern.map(compile).transpose()?;
    let exclude = exclude.map(compile).transpose()?;

    Ok(names
        .into_iter()
        .filter(|name| include.as_ref().map_or(true, |p| p.matches(name)))
        .filter(|name| !exclude.as_ref().is_some_and(|p| p.matches(name)))
        .filter(|name| {
            (target_suffix.is_empty() || !name.ends_with(target_suffix))
                && (backup_suffix.is_empty() || !name.ends_with(backup_suffix))
        })
        .cloned()
        .collect())
}

/// Runs [`Converter`] over many environments.
pub struct BatchOrchestrator {
    converter: Converter,
    options: BatchOptions,
    gate: Arc<dyn ConfirmationGate>,
}

impl BatchOrchestrator {
    pub fn new(converter: Converter, options: BatchOptions) -> Self {
        Self {
            converter,
            options,
            gate: Arc::new(TerminalPrompt),
        }
    }

    /// Replace the terminal prompt used for the disk-space confirmation.
    pub fn with_gate(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.gate = gate;
        self
    }

    fn dry_run(&self) -> bool {
        self.converter.options().dry_run
    }

    /// Convert every selected environment.
    pub async fn convert_many(&self) -> Result<BatchSummary, BatchError> {
        let converter = self.converter.clone();
        let search_paths = self.options.search_paths.clone();
        let max_depth = self.options.max_depth;
        let envs: BTreeMap<String, PathBuf> = tokio::task::spawn_blocking(move || {
            converter.inventory().discover(&search_paths, max_depth)
        })
        .await?;

        let selected = select_environments(
            envs.keys(),
            self.options.pattern.as_deref(),
            self.options.exclude.as_deref(),
            &self.options.target_suffix,
            &self.options.backup_suffix,
        )?;
        info!("[batch] {} of {} environments selected", selected.len(), envs.len());

        let mut summary = BatchSummary {
            dry_run: self.dry_run(),
            ..Default::default()
        };
        let mut jobs = Vec::new();
        for name in selected {
            let target = format!("{}{}", name, self.options.target_suffix);
            if envs.contains_key(&target) {
                info!("[batch] Skipping {}: {} already exists", name, target);
                summary.results.push(ConversionResult::skipped(
                    &name,
                    &target,
                    "target already exists",
                ));
                continue;
            }
            let path = envs.get(&name).cloned().unwrap_or_default();
            jobs.push(Job {
                source: name,
                path,
                target,
            });
        }

        if jobs.is_empty() {
            info!("[batch] Nothing to convert");
            return Ok(summary);
        }

        if !self.dry_run() {
            self.preflight(&jobs).await?;
            if self.options.backup {
                summary.backup_dir = Some(self.write_backups(&jobs).await?);
            }
        }

        let reports = if self.options.max_parallel <= 1 || self.dry_run() {
            self.run_sequential(&jobs).await?
        } else {
            self.run_parallel(&jobs).await
        };

        for report in reports {
            summary.results.push(report.result.clone());
            summary.reports.push(report);
        }
        summary.results.sort_by(|a, b| a.source.cmp(&b.source));

        info!(
            "[batch] Done: {} succeeded, {} failed, {} skipped",
            summary.success(),
            summary.failed(),
            summary.skipped()
        );
        Ok(summary)
    }

    async fn preflight(&self, jobs: &[Job]) -> Result<(), BatchError> {
        let conda = self.converter.inventory().conda().clone();
        let jobs_owned = jobs.to_vec();
        let package_count = tokio::task::spawn_blocking(move || {
            jobs_owned
                .iter()
                .map(|job| conda.list_packages(job.env_target()).map(|p| p.len()).unwrap_or(0))
                .sum::<usize>()
        })
        .await?;

        let required_mb = required_space_mb(package_count, self.options.mb_per_package);
        let Some(available_mb) = available_space_mb(&jobs[0].path) else {
            return Ok(());
        };
        info!(
            "[batch] {} packages, about {} MB needed, {} MB free",
            package_count, required_mb, available_mb
        );
        check_disk_space(
            required_mb,
            available_mb,
            self.options.assume_yes,
            self.gate.as_ref(),
        )
    }

    /// Export each environment into `<backup_root>/env_backups_<timestamp>/`.
    async fn write_backups(&self, jobs: &[Job]) -> Result<PathBuf, BatchError> {
        let dir = self.options.backup_root.join(format!(
            "env_backups_{}",
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        std::fs::create_dir_all(&dir).map_err(|source| BatchError::Backup {
            path: dir.clone(),
            source,
        })?;

        let conda = self.converter.inventory().conda().clone();
        let jobs_owned = jobs.to_vec();
        let backup_dir = dir.clone();
        tokio::task::spawn_blocking(move || {
            for job in &jobs_owned {
                let Some(yaml) = conda.export_raw(job.env_target(), false) else {
                    warn!("[batch] No backup written for {}: export failed", job.source);
                    continue;
                };
                let path = backup_dir.join(format!("{}.yml", job.source));
                if let Err(e) = std::fs::write(&path, yaml) {
                    warn!("[batch] Could not write backup {:?}: {}", path, e);
                }
            }
        })
        .await?;

        info!("[batch] Backups written to {:?}", dir);
        Ok(dir)
    }

    async fn run_sequential(&self, jobs: &[Job]) -> Result<Vec<ConversionReport>, BatchError> {
        let converter = self.converter.clone();
        let jobs = jobs.to_vec();
        let reports = tokio::task::spawn_blocking(move || {
            jobs.iter()
                .map(|job| converter.convert_at(&job.source, job.source_path(), &job.target))
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(reports)
    }

    async fn run_parallel(&self, jobs: &[Job]) -> Vec<ConversionReport> {
        info!(
            "[batch] Converting {} environments, {} at a time",
            jobs.len(),
            self.options.max_parallel
        );
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel));
        let mut set = JoinSet::new();

        for (idx, job) in jobs.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let converter = self.converter.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = tokio::task::spawn_blocking(move || {
                    converter.convert_at(&job.source, job.source_path(), &job.target)
                })
                .await;
                (idx, result)
            });
        }

        let mut slots: Vec<Option<ConversionReport>> = jobs.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Ok(report))) => slots[idx] = Some(report),
                Ok((idx, Err(e))) => {
                    error!("[batch] Conversion of {} panicked: {}", jobs[idx].source, e);
                }
                Err(e) => error!("[batch] Worker task failed: {}", e),
            }
        }

        slots
            .into_iter()
            .zip(jobs)
            .map(|(slot, job)| {
                slot.unwrap_or_else(|| {
                    ConversionReport::not_run(
                        &job.source,
                        &job.target,
                        ConversionResult::failed(&job.source, &job.target, "worker failed"),
                    )
                })
            })
            .collect()
    }
}
