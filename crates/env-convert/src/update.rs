//! Bringing a converted environment back in line with its source.
//!
//! The updater runs a drift comparison, picks the packages to touch, and
//! installs them one at a time so each result can be recorded separately.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::conda::CondaCli;
use crate::convert::FailedPackage;
use crate::drift::{detect_drift, DriftError, DriftReport};
use crate::inventory::Inventory;
use crate::package_spec::PackageSpec;

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub target_env: String,
    /// Move every changed package to its source version.
    pub update_all: bool,
    /// Install packages present only in the source.
    pub add_missing: bool,
    /// Only update these packages. Takes precedence over `update_all`.
    pub specific_packages: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub drift: DriftReport,
    /// Install specs selected for this run.
    pub planned: Vec<String>,
    pub updated: Vec<String>,
    pub added: Vec<String>,
    pub failed: Vec<FailedPackage>,
    /// Nothing was selected; only the drift report was produced.
    pub report_only: bool,
    pub dry_run: bool,
}

impl UpdateOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Incremental updater over an [`Inventory`].
pub struct Updater {
    inventory: Inventory,
    target_suffix: String,
    source_suffix: String,
}

impl Updater {
    pub fn new(inventory: Inventory, target_suffix: &str, source_suffix: &str) -> Self {
        Self {
            inventory,
            target_suffix: target_suffix.to_string(),
            source_suffix: source_suffix.to_string(),
        }
    }

    fn conda(&self) -> &CondaCli {
        self.inventory.conda()
    }

    /// Packages to move to their source version.
    fn select_updates(drift: &DriftReport, request: &UpdateRequest) -> Vec<PackageSpec> {
        if !request.specific_packages.is_empty() {
            let mut selected = Vec::new();
            for name in &request.specific_packages {
                if let Some(change) = drift.changed_versions.iter().find(|c| &c.name == name) {
                    selected.push(PackageSpec::conda(&change.name, Some(&change.source_version)));
                } else if let Some(missing) = drift.source_only.iter().find(|p| &p.name == name) {
                    selected.push(PackageSpec::conda(&missing.name, Some(&missing.version)));
                } else {
                    info!("[update] {} is not out of sync, skipping", name);
                }
            }
            return selected;
        }
        if request.update_all {
            return drift
                .changed_versions
                .iter()
                .map(|c| PackageSpec::conda(&c.name, Some(&c.source_version)))
                .collect();
        }
        Vec::new()
    }

    fn select_additions(drift: &DriftReport, request: &UpdateRequest, already: &[PackageSpec]) -> Vec<PackageSpec> {
        if !request.add_missing {
            return Vec::new();
        }
        drift
            .source_only
            .iter()
            .filter(|p| !already.iter().any(|s| s.name == p.name))
            .map(|p| PackageSpec::conda(&p.name, Some(&p.version)))
            .collect()
    }

    /// Apply `request` to its target environment.
    pub fn update(&self, request: &UpdateRequest) -> Result<UpdateOutcome, DriftError> {
        let drift = detect_drift(
            &self.inventory,
            &request.target_env,
            &self.target_suffix,
            &self.source_suffix,
        )?;

        let updates = Self::select_updates(&drift, request);
        let additions = Self::select_additions(&drift, request, &updates);
        let planned: Vec<String> = updates
            .iter()
            .chain(additions.iter())
            .map(PackageSpec::install_spec)
            .collect();

        let mut outcome = UpdateOutcome {
            drift,
            report_only: updates.is_empty() && additions.is_empty(),
            planned,
            updated: Vec::new(),
            added: Vec::new(),
            failed: Vec::new(),
            dry_run: request.dry_run,
        };

        if outcome.report_only {
            info!("[update] Nothing selected for {}, report only", request.target_env);
            return Ok(outcome);
        }
        if request.dry_run {
            info!(
                "[update] Dry run: would install {} into {}",
                outcome.planned.join(" "),
                request.target_env
            );
            return Ok(outcome);
        }

        for (spec, is_update) in updates
            .iter()
            .map(|s| (s, true))
            .chain(additions.iter().map(|s| (s, false)))
        {
            match self.conda().install(&request.target_env, &[spec.install_spec()]) {
                Ok(()) => {
                    info!("[update] Installed {} into {}", spec.install_spec(), request.target_env);
                    if is_update {
                        outcome.updated.push(spec.name.clone());
                    } else {
                        outcome.added.push(spec.name.clone());
                    }
                }
                Err(e) => {
                    warn!("[update] Could not install {}: {}", spec.install_spec(), e);
                    outcome.failed.push(FailedPackage {
                        name: spec.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }
}
