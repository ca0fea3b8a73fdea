//! Structured report assembled from inventory, batch and drift results.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchSummary;
use crate::drift::DriftReport;
use crate::inventory::Inventory;

/// One discovered environment with its package counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSummary {
    pub name: String,
    pub path: PathBuf,
    pub python_version: Option<String>,
    pub conda_packages: usize,
    pub pip_packages: usize,
}

impl EnvironmentSummary {
    /// Summarize `name` from its installed packages, addressed by `path` so
    /// environments found only on disk resolve too. Counts are zero when the
    /// listing is unavailable.
    pub fn collect(inventory: &Inventory, name: &str, path: &Path) -> Self {
        let installed = if path.as_os_str().is_empty() {
            inventory.installed_packages(name)
        } else {
            inventory.installed_packages(path)
        }
        .unwrap_or_default();
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            python_version: installed.python_version().map(str::to_string),
            conda_packages: installed.conda.len(),
            pip_packages: installed.pip.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub environments: Vec<EnvironmentSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSummary>,
    #[serde(default)]
    pub drift: Vec<DriftReport>,
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl Report {
    pub fn new() -> Self {
        Self {
            generated_at: Utc::now(),
            environments: Vec::new(),
            batch: None,
            drift: Vec::new(),
        }
    }

    pub fn with_environments(mut self, environments: Vec<EnvironmentSummary>) -> Self {
        self.environments = environments;
        self
    }

    pub fn with_batch(mut self, batch: BatchSummary) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_drift(mut self, drift: Vec<DriftReport>) -> Self {
        self.drift = drift;
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the JSON rendering to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Plain-text rendering for terminals and log files.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Environment report ({})",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        let _ = writeln!(out, "\nEnvironments: {}", self.environments.len());
        for env in &self.environments {
            let _ = writeln!(
                out,
                "  {:<24} python {:<8} {:>4} conda {:>4} pip  {}",
                env.name,
                env.python_version.as_deref().unwrap_or("-"),
                env.conda_packages,
                env.pip_packages,
                env.path.display()
            );
        }

        if let Some(batch) = &self.batch {
            let _ = writeln!(
                out,
                "\nConversion: {} succeeded, {} failed, {} skipped{}",
                batch.success(),
                batch.failed(),
                batch.skipped(),
                if batch.dry_run { " (dry run)" } else { "" }
            );
            for result in &batch.results {
                let _ = write!(out, "  {:<8} {} -> {}", result.outcome, result.source, result.target);
                if let Some(reason) = &result.reason {
                    let _ = write!(out, " ({})", reason);
                }
                out.push('\n');
            }
            if let Some(dir) = &batch.backup_dir {
                let _ = writeln!(out, "  backups: {}", dir.display());
            }
        }

        for drift in &self.drift {
            let _ = writeln!(
                out,
                "\nDrift {} -> {}: {:.1}% similar",
                drift.source_env, drift.target_env, drift.similarity_percent
            );
            for change in &drift.changed_versions {
                let _ = writeln!(
                    out,
                    "  ~ {} {} -> {}",
                    change.name, change.source_version, change.target_version
                );
            }
            for pkg in &drift.source_only {
                let _ = writeln!(out, "  - {} {}", pkg.name, pkg.version);
            }
            for pkg in &drift.target_only {
                let _ = writeln!(out, "  + {} {}", pkg.name, pkg.version);
            }
        }

        out
    }
}
