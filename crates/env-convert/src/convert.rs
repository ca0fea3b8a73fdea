//! Single-environment conversion.
//!
//! A conversion walks strictly forward through [`ConversionStage`]s:
//!
//! ```text
//! Pending -> TargetChecked -> Inventoried -> BaseCreated
//!         -> CondaInstalled -> PipInstalled -> Verified
//! ```
//!
//! Any stage may end in `Failed`. Packages are installed in bounded batches;
//! a failed batch is retried one package at a time so a single broken
//! package never takes the rest of the environment down with it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::MetadataCache;
use crate::conda::CondaCli;
use crate::inventory::{registry_name, EnvironmentInfo, Inventory};
use crate::package_spec::{PackageOrigin, PackageSpec};
use crate::progress::{ConversionPhase, ProgressHandler};
use crate::runner::CommandError;

/// Default number of packages per install command.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Default suffix for in-place replacement backups.
pub const DEFAULT_BACKUP_SUFFIX: &str = "_anaconda_backup";

/// Reason recorded for packages the target channel does not carry.
pub const NOT_AVAILABLE_REASON: &str = "not available in channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStage {
    Pending,
    TargetChecked,
    Inventoried,
    BaseCreated,
    CondaInstalled,
    PipInstalled,
    Verified,
    Failed,
}

/// Closed set of conversion outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failed => "FAILED",
            Outcome::Skipped => "SKIPPED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub source: String,
    pub target: String,
    pub outcome: Outcome,
    pub reason: Option<String>,
}

impl ConversionResult {
    pub fn success(source: &str, target: &str) -> Self {
        Self::new(source, target, Outcome::Success, None)
    }

    pub fn failed(source: &str, target: &str, reason: impl Into<String>) -> Self {
        Self::new(source, target, Outcome::Failed, Some(reason.into()))
    }

    pub fn skipped(source: &str, target: &str, reason: impl Into<String>) -> Self {
        Self::new(source, target, Outcome::Skipped, Some(reason.into()))
    }

    fn new(source: &str, target: &str, outcome: Outcome, reason: Option<String>) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            outcome,
            reason,
        }
    }
}

/// A package the installer rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPackage {
    pub name: String,
    pub reason: String,
}

/// What one install stage managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub installed: Vec<String>,
    pub failed: Vec<FailedPackage>,
}

impl InstallOutcome {
    pub fn requested(&self) -> usize {
        self.installed.len() + self.failed.len()
    }

    /// A non-empty stage where nothing installed.
    pub fn hard_failed(&self) -> bool {
        self.requested() > 0 && self.installed.is_empty()
    }
}

/// Knobs for a single conversion.
#[derive(Debug, Clone)]
pub struct ConversionOptions {
    /// Python version for the target; wins over the detected one.
    pub python_override: Option<String>,
    pub dry_run: bool,
    pub batch_size: usize,
    /// Allow an existing target and continue installing into it.
    pub resume: bool,
    /// Match the target's ownership to the source when running as root.
    pub preserve_ownership: bool,
    /// Look each conda package up in the target channel before installing.
    pub check_availability: bool,
    pub backup_suffix: String,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            python_override: None,
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            resume: false,
            preserve_ownership: false,
            check_availability: false,
            backup_suffix: DEFAULT_BACKUP_SUFFIX.to_string(),
        }
    }
}

/// Everything known about one conversion attempt once it stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionReport {
    pub result: ConversionResult,
    /// Last stage reached.
    pub stage: ConversionStage,
    pub python_version: Option<String>,
    pub explicit_only: bool,
    pub conda_count: usize,
    pub pip_count: usize,
    pub conda: InstallOutcome,
    pub pip: InstallOutcome,
    pub dry_run: bool,
}

impl ConversionReport {
    fn new(source: &str, target: &str, dry_run: bool) -> Self {
        Self {
            result: ConversionResult::success(source, target),
            stage: ConversionStage::Pending,
            python_version: None,
            explicit_only: false,
            conda_count: 0,
            pip_count: 0,
            conda: InstallOutcome::default(),
            pip: InstallOutcome::default(),
            dry_run,
        }
    }

    /// A report for a conversion that never got to run.
    pub fn not_run(source: &str, target: &str, result: ConversionResult) -> Self {
        let mut report = Self::new(source, target, false);
        if result.outcome == Outcome::Failed {
            report.stage = ConversionStage::Failed;
        }
        report.result = result;
        report
    }

    pub fn outcome(&self) -> Outcome {
        self.result.outcome
    }

    pub fn is_success(&self) -> bool {
        self.result.outcome == Outcome::Success
    }
}

/// Errors from [`Converter::replace_in_place`] that stop before anything is
/// removed.
#[derive(Debug, thiserror::Error)]
pub enum ReplaceError {
    #[error("environment {0} does not exist")]
    MissingSource(String),

    #[error("backup of {name} to {backup} failed, original left untouched: {source}")]
    BackupFailed {
        name: String,
        backup: String,
        #[source]
        source: CommandError,
    },

    #[error("could not remove {name} after backing it up to {backup}: {source}")]
    RemoveFailed {
        name: String,
        backup: String,
        #[source]
        source: CommandError,
    },
}

/// Last non-empty stderr line of a failure, short enough for a summary table.
fn short_reason(err: &CommandError) -> String {
    let text = match err {
        CommandError::Failed { stderr, status, .. } => stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("exited with {}", status)),
        other => other.to_string(),
    };
    text.chars().take(200).collect()
}

/// Drives one environment through the conversion stages.
#[derive(Clone)]
pub struct Converter {
    conda: CondaCli,
    inventory: Inventory,
    options: ConversionOptions,
    progress: Arc<dyn ProgressHandler>,
    cache: Option<MetadataCache>,
}

impl Converter {
    pub fn new(
        conda: CondaCli,
        options: ConversionOptions,
        progress: Arc<dyn ProgressHandler>,
    ) -> Self {
        Self {
            inventory: Inventory::new(conda.clone()),
            conda,
            options,
            progress,
            cache: None,
        }
    }

    /// Use `cache` for channel availability lookups.
    pub fn with_cache(mut self, cache: MetadataCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    fn emit(&self, env: &str, phase: ConversionPhase) {
        self.progress.on_progress(env, phase);
    }

    fn fail(&self, mut report: ConversionReport, reason: String) -> ConversionReport {
        let source = report.result.source.clone();
        self.emit(
            &source,
            ConversionPhase::Failed {
                message: reason.clone(),
            },
        );
        report.result = ConversionResult::failed(&source, &report.result.target, reason);
        report.stage = ConversionStage::Failed;
        report
    }

    /// Convert `source` into a new environment `target`.
    pub fn convert(&self, source: &str, target: &str) -> ConversionReport {
        self.convert_at(source, None, target)
    }

    /// Like [`Converter::convert`], with the source's on-disk location when it
    /// is already known (needed for ownership preservation).
    pub fn convert_at(
        &self,
        source: &str,
        source_path: Option<&Path>,
        target: &str,
    ) -> ConversionReport {
        let mut report = ConversionReport::new(source, target, self.options.dry_run);
        self.emit(
            source,
            ConversionPhase::Starting {
                source: source.to_string(),
                target: target.to_string(),
            },
        );

        // Target check
        let target_exists = self.inventory.exists(target);
        self.emit(source, ConversionPhase::TargetChecked { exists: target_exists });
        if target_exists && !self.options.dry_run && !self.options.resume {
            return self.fail(report, format!("target environment {} already exists", target));
        }
        report.stage = ConversionStage::TargetChecked;

        // Inventory
        let Some(info) = self.inventory.environment_info(source, source_path) else {
            return self.fail(
                report,
                format!("could not determine packages for {}", source),
            );
        };
        let python = self
            .options
            .python_override
            .clone()
            .or_else(|| info.python_version.clone());
        report.python_version = python.clone();
        report.explicit_only = info.explicit_only;
        report.conda_count = info.conda_packages.len();
        report.pip_count = info.pip_packages.len();
        report.stage = ConversionStage::Inventoried;
        self.emit(
            source,
            ConversionPhase::Inventoried {
                conda_count: report.conda_count,
                pip_count: report.pip_count,
                explicit_only: info.explicit_only,
            },
        );
        if !info.explicit_only {
            warn!(
                "[convert] {} has no install history, converting its full package set",
                source
            );
        }

        if self.options.dry_run {
            self.emit(
                source,
                ConversionPhase::DryRun {
                    conda_packages: info.conda_packages.iter().map(|p| p.install_spec()).collect(),
                    pip_packages: info.pip_packages.iter().map(|p| p.install_spec()).collect(),
                },
            );
            report.result.reason = Some("dry run".to_string());
            return report;
        }

        // Base environment
        if target_exists {
            info!("[convert] Resuming into existing environment {}", target);
        } else {
            self.emit(
                source,
                ConversionPhase::CreatingBase {
                    python: python.clone(),
                },
            );
            info!(
                "[convert] Creating {} with {}",
                target,
                self.conda.manager_name()
            );
            if let Err(e) = self.conda.create(target, python.as_deref(), &[]) {
                return self.fail(
                    report,
                    format!("failed to create base environment: {}", short_reason(&e)),
                );
            }
        }
        report.stage = ConversionStage::BaseCreated;

        // Conda packages; python was pinned at creation
        let conda_packages: Vec<PackageSpec> = info
            .conda_packages
            .iter()
            .filter(|p| p.name != "python")
            .cloned()
            .collect();
        report.conda = self.install_conda(source, target, &conda_packages);
        report.stage = ConversionStage::CondaInstalled;

        report.pip = self.install_batched(source, target, PackageOrigin::Pip, &info.pip_packages);
        report.stage = ConversionStage::PipInstalled;

        if report.conda.hard_failed() {
            return self.fail(report, "no conda packages could be installed".to_string());
        }
        if report.pip.hard_failed() {
            return self.fail(report, "no pip packages could be installed".to_string());
        }

        // Verify
        if !self.inventory.exists(target) {
            return self.fail(
                report,
                format!("target environment {} missing after conversion", target),
            );
        }
        report.stage = ConversionStage::Verified;
        self.emit(
            source,
            ConversionPhase::Verified {
                target: target.to_string(),
            },
        );

        let failed = report.conda.failed.len() + report.pip.failed.len();
        if failed > 0 {
            warn!(
                "[convert] {} converted with {} package(s) missing",
                target, failed
            );
            report.result.reason = Some(format!("{} package(s) failed to install", failed));
        }

        if self.options.preserve_ownership {
            self.preserve_ownership(source, source_path, &info, target);
        }

        report
    }

    fn install_conda(&self, source: &str, target: &str, packages: &[PackageSpec]) -> InstallOutcome {
        if !self.options.check_availability {
            return self.install_batched(source, target, PackageOrigin::Conda, packages);
        }

        let mut unavailable = Vec::new();
        let mut available = Vec::new();
        for package in packages {
            if self.is_available(&package.name) {
                available.push(package.clone());
            } else {
                self.emit(
                    source,
                    ConversionPhase::PackageFailed {
                        package: package.name.clone(),
                        origin: PackageOrigin::Conda.to_string(),
                        reason: NOT_AVAILABLE_REASON.to_string(),
                    },
                );
                unavailable.push(FailedPackage {
                    name: package.name.clone(),
                    reason: NOT_AVAILABLE_REASON.to_string(),
                });
            }
        }

        let mut outcome = self.install_batched(source, target, PackageOrigin::Conda, &available);
        outcome.failed.extend(unavailable);
        outcome
    }

    /// Whether the target channel carries `package`. Lookups that fail are
    /// treated as available and left to the installer.
    fn is_available(&self, package: &str) -> bool {
        let channel = self.conda.channels().join(",");
        let key = format!("search/{}/{}", channel, package);

        if let Some(cache) = &self.cache {
            if let Some(serde_json::Value::Array(versions)) = cache.get(&key) {
                return !versions.is_empty();
            }
        }

        match self.conda.search(package) {
            Some(versions) => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.set(&key, serde_json::json!(versions)) {
                        warn!("[convert] Could not cache search result for {}: {}", package, e);
                    }
                }
                !versions.is_empty()
            }
            None => true,
        }
    }

    fn install(
        &self,
        origin: PackageOrigin,
        target: &str,
        specs: &[String],
    ) -> Result<(), CommandError> {
        match origin {
            PackageOrigin::Conda => self.conda.install(target, specs),
            PackageOrigin::Pip => self.conda.pip_install(target, specs),
        }
    }

    /// Install `packages` in batches, falling back to one-at-a-time for any
    /// batch the installer rejects.
    pub fn install_batched(
        &self,
        source: &str,
        target: &str,
        origin: PackageOrigin,
        packages: &[PackageSpec],
    ) -> InstallOutcome {
        let mut outcome = InstallOutcome::default();
        if packages.is_empty() {
            return outcome;
        }

        let batch_size = self.options.batch_size.max(1);
        let total_batches = packages.len().div_ceil(batch_size);

        for (idx, chunk) in packages.chunks(batch_size).enumerate() {
            let batch = idx + 1;
            let specs: Vec<String> = chunk.iter().map(PackageSpec::install_spec).collect();
            self.emit(
                source,
                ConversionPhase::InstallingBatch {
                    origin: origin.to_string(),
                    batch,
                    total_batches,
                    size: chunk.len(),
                },
            );

            match self.install(origin, target, &specs) {
                Ok(()) => {
                    outcome.installed.extend(chunk.iter().map(|p| p.name.clone()));
                }
                Err(e) => {
                    debug!("[convert] Batch {} failed: {}", batch, e);
                    self.emit(
                        source,
                        ConversionPhase::BatchFallback {
                            origin: origin.to_string(),
                            batch,
                        },
                    );
                    for (package, spec) in chunk.iter().zip(specs) {
                        match self.install(origin, target, &[spec]) {
                            Ok(()) => outcome.installed.push(package.name.clone()),
                            Err(e) => {
                                let reason = short_reason(&e);
                                self.emit(
                                    source,
                                    ConversionPhase::PackageFailed {
                                        package: package.name.clone(),
                                        origin: origin.to_string(),
                                        reason: reason.clone(),
                                    },
                                );
                                outcome.failed.push(FailedPackage {
                                    name: package.name.clone(),
                                    reason,
                                });
                            }
                        }
                    }
                }
            }
        }

        outcome
    }

    fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.conda
            .env_list()?
            .into_iter()
            .find(|p| registry_name(p) == name)
    }

    fn preserve_ownership(
        &self,
        source: &str,
        source_path: Option<&Path>,
        info: &EnvironmentInfo,
        target: &str,
    ) {
        let source_path = source_path
            .map(Path::to_path_buf)
            .or_else(|| info.path.clone())
            .or_else(|| self.path_of(source));
        let (Some(source_path), Some(target_path)) = (source_path, self.path_of(target)) else {
            warn!("[convert] Could not locate {} or {} to copy ownership", source, target);
            return;
        };

        match ownership::copy_ownership(&source_path, &target_path) {
            Ok(Some((uid, gid))) => {
                self.emit(source, ConversionPhase::OwnershipPreserved { uid, gid });
            }
            Ok(None) => debug!("[convert] Not running as root, ownership left as is"),
            Err(e) => warn!("[convert] Could not preserve ownership of {}: {}", target, e),
        }
    }

    /// Replace `name` with a converted copy under the same name.
    ///
    /// The original is cloned to `<name><backup_suffix>` first (replacing any
    /// earlier backup). If that fails nothing is removed.
    pub fn replace_in_place(&self, name: &str) -> Result<ConversionReport, ReplaceError> {
        if !self.inventory.exists(name) {
            return Err(ReplaceError::MissingSource(name.to_string()));
        }
        let backup = format!("{}{}", name, self.options.backup_suffix);

        if self.options.dry_run {
            info!("[convert] Dry run: would back up {} to {} and convert in place", name, backup);
            return Ok(self.convert(name, name));
        }

        if self.inventory.exists(&backup) {
            info!("[convert] Replacing previous backup {}", backup);
            if let Err(e) = self.conda.remove_env(&backup) {
                warn!("[convert] Could not remove previous backup {}: {}", backup, e);
            }
        }

        self.conda
            .clone_env(name, &backup)
            .map_err(|source| ReplaceError::BackupFailed {
                name: name.to_string(),
                backup: backup.clone(),
                source,
            })?;
        info!("[convert] Backed up {} to {}", name, backup);

        self.conda
            .remove_env(name)
            .map_err(|source| ReplaceError::RemoveFailed {
                name: name.to_string(),
                backup: backup.clone(),
                source,
            })?;

        let mut report = self.convert(&backup, name);
        if !report.is_success() {
            warn!(
                "[convert] In-place conversion of {} failed; original is preserved as {}",
                name, backup
            );
        }
        report.result.source = name.to_string();
        Ok(report)
    }
}

#[cfg(unix)]
mod ownership {
    use std::io;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;

    use nix::unistd::{chown, geteuid, Gid, Uid};
    use walkdir::WalkDir;

    /// Apply the uid/gid of `source` to every entry under `target`.
    ///
    /// Returns `Ok(None)` without touching anything unless running as root.
    /// Symlinks are left alone so nothing outside `target` changes owner.
    pub fn copy_ownership(source: &Path, target: &Path) -> io::Result<Option<(u32, u32)>> {
        if !geteuid().is_root() {
            return Ok(None);
        }
        let meta = std::fs::metadata(source)?;
        let (uid, gid) = (meta.uid(), meta.gid());

        for entry in WalkDir::new(target).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.path_is_symlink() {
                continue;
            }
            chown(entry.path(), Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
        }
        Ok(Some((uid, gid)))
    }
}

#[cfg(not(unix))]
mod ownership {
    use std::io;
    use std::path::Path;

    pub fn copy_ownership(_source: &Path, _target: &Path) -> io::Result<Option<(u32, u32)>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingHandler;
    use crate::testing::FakeConda;
    use tempfile::TempDir;

    fn converter(fake: &Arc<FakeConda>, options: ConversionOptions) -> (Converter, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::new());
        let conda = CondaCli::new(fake.clone());
        (Converter::new(conda, options, handler.clone()), handler)
    }

    fn specs(names: &[&str]) -> Vec<PackageSpec> {
        names.iter().map(|n| PackageSpec::conda(*n, None)).collect()
    }

    #[test]
    fn test_convert_creates_target() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("python", "3.11.4"), ("numpy", "1.24.3")]);
        fake.add_pip("proj", &[("flask", "2.0.1")]);
        fake.set_history("proj", &["python=3.11", "numpy=1.24"]);

        let (converter, handler) = converter(&fake, ConversionOptions::default());
        let report = converter.convert("proj", "proj_forge");

        assert!(report.is_success(), "{:?}", report.result);
        assert_eq!(report.stage, ConversionStage::Verified);
        assert_eq!(report.python_version.as_deref(), Some("3.11"));
        assert_eq!(report.conda.installed, vec!["numpy"]);
        assert_eq!(report.pip.installed, vec!["flask"]);

        let target = fake.env("proj_forge").unwrap();
        assert_eq!(target.conda["python"], "3.11");
        assert_eq!(target.conda["numpy"], "1.24");
        assert_eq!(target.pip["flask"], "2.0.1");

        let phases = handler.phases_for("proj");
        assert!(matches!(phases.first(), Some(ConversionPhase::Starting { .. })));
        assert!(matches!(phases.last(), Some(ConversionPhase::Verified { .. })));
    }

    #[test]
    fn test_existing_target_fails() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24")]);
        fake.add_env("proj_forge", &[("numpy", "1.24")]);

        let (converter, _) = converter(&fake, ConversionOptions::default());
        let report = converter.convert("proj", "proj_forge");

        assert_eq!(report.outcome(), Outcome::Failed);
        assert!(report.result.reason.unwrap().contains("already exists"));
        assert!(!fake.calls().iter().any(|c| c.starts_with("create")));
    }

    #[test]
    fn test_resume_skips_base_creation() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24"), ("scipy", "1.11")]);
        fake.add_env("proj_forge", &[("numpy", "1.24")]);

        let options = ConversionOptions {
            resume: true,
            ..Default::default()
        };
        let (converter, _) = converter(&fake, options);
        let report = converter.convert("proj", "proj_forge");

        assert!(report.is_success());
        assert!(!fake.calls().iter().any(|c| c.starts_with("create")));
        assert_eq!(fake.env("proj_forge").unwrap().conda["scipy"], "1.11");
    }

    #[test]
    fn test_missing_packages_fail() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("empty", &[]);

        let (converter, _) = converter(&fake, ConversionOptions::default());
        let report = converter.convert("empty", "empty_forge");

        assert_eq!(report.outcome(), Outcome::Failed);
        assert_eq!(report.stage, ConversionStage::Failed);
        assert!(report
            .result
            .reason
            .unwrap()
            .contains("could not determine packages"));
        assert!(!fake.has_env("empty_forge"));
    }

    #[test]
    fn test_dry_run_reports_without_creating() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("python", "3.9.18"), ("numpy", "1.24")]);
        fake.add_env("proj_forge", &[]);

        let (converter, handler) = converter(
            &fake,
            ConversionOptions {
                dry_run: true,
                ..Default::default()
            },
        );
        let report = converter.convert("proj", "proj_forge");

        assert!(report.is_success());
        assert!(report.dry_run);
        assert_eq!(report.stage, ConversionStage::Inventoried);
        assert_eq!(report.conda_count, 2);
        assert_eq!(report.python_version.as_deref(), Some("3.9"));
        assert!(!fake
            .calls()
            .iter()
            .any(|c| c.starts_with("create") || c.starts_with("install")));
        assert!(handler
            .phases_for("proj")
            .iter()
            .any(|p| matches!(p, ConversionPhase::DryRun { .. })));
    }

    #[test]
    fn test_python_override_wins() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("python", "3.8.10"), ("numpy", "1.24")]);

        let (converter, _) = converter(
            &fake,
            ConversionOptions {
                python_override: Some("3.12".to_string()),
                ..Default::default()
            },
        );
        let report = converter.convert("proj", "proj_forge");

        assert_eq!(report.python_version.as_deref(), Some("3.12"));
        assert_eq!(fake.env("proj_forge").unwrap().conda["python"], "3.12");
    }

    #[test]
    fn test_batch_fallback_isolates_broken_package() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("target", &[]);
        fake.break_package("pkg7");

        let (converter, handler) = converter(&fake, ConversionOptions::default());
        let packages = specs(&[
            "pkg0", "pkg1", "pkg2", "pkg3", "pkg4", "pkg5", "pkg6", "pkg7", "pkg8", "pkg9",
        ]);
        let outcome = converter.install_batched("src", "target", PackageOrigin::Conda, &packages);

        assert_eq!(outcome.installed.len(), 9);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].name, "pkg7");
        assert!(!outcome.hard_failed());
        assert!(handler
            .phases_for("src")
            .contains(&ConversionPhase::BatchFallback {
                origin: "conda".to_string(),
                batch: 1
            }));
    }

    #[test]
    fn test_batches_are_bounded() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("target", &[]);

        let (converter, _) = converter(
            &fake,
            ConversionOptions {
                batch_size: 3,
                ..Default::default()
            },
        );
        let packages = specs(&["a", "b", "c", "d", "e", "f", "g"]);
        let outcome = converter.install_batched("src", "target", PackageOrigin::Conda, &packages);

        assert_eq!(outcome.installed.len(), 7);
        let installs = fake
            .calls()
            .iter()
            .filter(|c| c.starts_with("install"))
            .count();
        assert_eq!(installs, 3);
    }

    #[test]
    fn test_all_conda_packages_failing_is_hard_failure() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("python", "3.11"), ("bad1", "1.0"), ("bad2", "1.0")]);
        fake.break_package("bad1");
        fake.break_package("bad2");

        let (converter, _) = converter(&fake, ConversionOptions::default());
        let report = converter.convert("proj", "proj_forge");

        assert_eq!(report.outcome(), Outcome::Failed);
        assert_eq!(report.conda.failed.len(), 2);
        assert!(report.conda.hard_failed());
    }

    #[test]
    fn test_partial_success_is_success() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24"), ("legacy", "0.1")]);
        fake.break_package("legacy");

        let (converter, _) = converter(&fake, ConversionOptions::default());
        let report = converter.convert("proj", "proj_forge");

        assert!(report.is_success());
        assert_eq!(report.result.reason.as_deref(), Some("1 package(s) failed to install"));
    }

    #[test]
    fn test_create_failure_fails_conversion() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24")]);
        fake.fail_on("create -n proj_forge");

        let (converter, _) = converter(&fake, ConversionOptions::default());
        let report = converter.convert("proj", "proj_forge");

        assert_eq!(report.outcome(), Outcome::Failed);
        assert_eq!(report.stage, ConversionStage::Failed);
        assert!(report.result.reason.unwrap().contains("base environment"));
    }

    #[test]
    fn test_availability_check_uses_cache() {
        let temp = TempDir::new().unwrap();
        let cache = MetadataCache::new(temp.path().to_path_buf());
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24"), ("defaults-only", "1.0")]);
        fake.set_channel_versions("numpy", &["1.24"]);

        let options = ConversionOptions {
            check_availability: true,
            ..Default::default()
        };
        let (converter, _) = converter(&fake, options);
        let converter = converter.with_cache(cache.clone());

        let report = converter.convert("proj", "proj_forge");
        assert!(report.is_success());
        assert_eq!(report.conda.installed, vec!["numpy"]);
        assert_eq!(
            report.conda.failed,
            vec![FailedPackage {
                name: "defaults-only".to_string(),
                reason: NOT_AVAILABLE_REASON.to_string(),
            }]
        );
        assert_eq!(
            cache.get("search/conda-forge/numpy"),
            Some(serde_json::json!(["1.24"]))
        );

        let searches_before = fake.calls().iter().filter(|c| c.starts_with("search")).count();
        converter.convert("proj", "proj_forge2");
        let searches_after = fake.calls().iter().filter(|c| c.starts_with("search")).count();
        assert_eq!(searches_before, searches_after);
    }

    #[test]
    fn test_ownership_problems_do_not_fail_conversion() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24")]);

        let options = ConversionOptions {
            preserve_ownership: true,
            ..Default::default()
        };
        let (converter, handler) = converter(&fake, options);
        let report = converter.convert("proj", "proj_forge");

        // The fake prefixes do not exist on disk, so ownership cannot be copied
        assert!(report.is_success(), "{:?}", report.result);
        assert_eq!(report.stage, ConversionStage::Verified);
        assert!(!handler
            .phases_for("proj")
            .iter()
            .any(|p| matches!(p, ConversionPhase::OwnershipPreserved { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_ownership_only_as_root() {
        use std::os::unix::fs::MetadataExt;

        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::fs::create_dir_all(target.path().join("lib")).unwrap();
        std::fs::write(target.path().join("lib").join("mod.py"), "").unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", target.path().join("dangling")).unwrap();

        let result = ownership::copy_ownership(source.path(), target.path()).unwrap();

        if nix::unistd::geteuid().is_root() {
            let meta = std::fs::metadata(source.path()).unwrap();
            assert_eq!(result, Some((meta.uid(), meta.gid())));
            let file = std::fs::metadata(target.path().join("lib").join("mod.py")).unwrap();
            assert_eq!((file.uid(), file.gid()), (meta.uid(), meta.gid()));
        } else {
            assert_eq!(result, None);
        }
    }

    #[test]
    fn test_replace_in_place() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24")]);

        let (converter, _) = converter(&fake, ConversionOptions::default());
        let report = converter.replace_in_place("proj").unwrap();

        assert!(report.is_success());
        assert_eq!(report.result.source, "proj");
        assert!(fake.has_env("proj_anaconda_backup"));
        assert!(fake.has_env("proj"));
    }

    #[test]
    fn test_replace_replaces_previous_backup() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24")]);
        fake.add_env("proj_anaconda_backup", &[("stale", "0.1")]);

        let (converter, _) = converter(&fake, ConversionOptions::default());
        converter.replace_in_place("proj").unwrap();

        let backup = fake.env("proj_anaconda_backup").unwrap();
        assert!(backup.conda.contains_key("numpy"));
        assert!(!backup.conda.contains_key("stale"));
    }

    #[test]
    fn test_failed_backup_leaves_original() {
        let fake = Arc::new(FakeConda::new());
        fake.add_env("proj", &[("numpy", "1.24")]);
        fake.fail_on("--clone");

        let (converter, _) = converter(&fake, ConversionOptions::default());
        let err = converter.replace_in_place("proj").unwrap_err();

        assert!(matches!(err, ReplaceError::BackupFailed { .. }));
        assert!(fake.has_env("proj"));
        assert!(!fake.calls().iter().any(|c| c.starts_with("env remove")));
    }

    #[test]
    fn test_short_reason_uses_last_stderr_line() {
        let err = CommandError::Failed {
            command: "conda install".to_string(),
            status: "exit status: 1".to_string(),
            code: Some(1),
            stdout: String::new(),
            stderr: "Collecting package metadata\nPackagesNotFoundError: foo\n".to_string(),
        };
        assert_eq!(short_reason(&err), "PackagesNotFoundError: foo");
    }
}
