//! Package-level comparison between two environments.
//!
//! Comparison is set algebra over conda-origin `name -> version` maps taken
//! from `conda list`. Pip-origin packages are ignored here.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use serde::{Deserialize, Serialize};

use crate::inventory::Inventory;

#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    #[error("environment {0} not found")]
    MissingEnvironment(String),
}

/// A package present on one side only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedVersion {
    pub name: String,
    pub version: String,
}

/// A package present on both sides at different versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChange {
    pub name: String,
    pub source_version: String,
    pub target_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub source_env: String,
    pub target_env: String,
    pub source_only: Vec<NamedVersion>,
    pub target_only: Vec<NamedVersion>,
    pub changed_versions: Vec<VersionChange>,
    pub same_versions: Vec<NamedVersion>,
    pub similarity_percent: f64,
}

impl DriftReport {
    /// No package differs between the two environments.
    pub fn is_in_sync(&self) -> bool {
        self.source_only.is_empty() && self.target_only.is_empty() && self.changed_versions.is_empty()
    }
}

fn named(map: &BTreeMap<String, String>, names: impl Iterator<Item = String>) -> Vec<NamedVersion> {
    names
        .map(|name| NamedVersion {
            version: map.get(&name).cloned().unwrap_or_default(),
            name,
        })
        .collect()
}

/// Compare two `name -> version` maps.
///
/// Similarity is `|same| / |A ∪ B| * 100`, rounded to one decimal and 0 for
/// two empty inputs. All lists are sorted by name.
pub fn compare_packages(
    source_env: &str,
    source: &BTreeMap<String, String>,
    target_env: &str,
    target: &BTreeMap<String, String>,
) -> DriftReport {
    let source_names: BTreeSet<&String> = source.keys().collect();
    let target_names: BTreeSet<&String> = target.keys().collect();

    let source_only = named(
        source,
        source_names.difference(&target_names).map(|n| n.to_string()),
    );
    let target_only = named(
        target,
        target_names.difference(&source_names).map(|n| n.to_string()),
    );

    let mut changed_versions = Vec::new();
    let mut same_versions = Vec::new();
    for name in source_names.intersection(&target_names) {
        let (a, b) = (&source[*name], &target[*name]);
        if a == b {
            same_versions.push(NamedVersion {
                name: name.to_string(),
                version: a.clone(),
            });
        } else {
            changed_versions.push(VersionChange {
                name: name.to_string(),
                source_version: a.clone(),
                target_version: b.clone(),
            });
        }
    }

    let union = source_names.union(&target_names).count();
    let similarity_percent = if union == 0 {
        0.0
    } else {
        let raw = same_versions.len() as f64 / union as f64 * 100.0;
        (raw * 10.0).round() / 10.0
    };

    DriftReport {
        source_env: source_env.to_string(),
        target_env: target_env.to_string(),
        source_only,
        target_only,
        changed_versions,
        same_versions,
        similarity_percent,
    }
}

/// Compare the installed conda packages of two environments.
pub fn compare(inventory: &Inventory, env_a: &str, env_b: &str) -> Result<DriftReport, DriftError> {
    let load = |name: &str| {
        inventory
            .installed_packages(name)
            .map(|p| p.conda_versions())
            .ok_or_else(|| DriftError::MissingEnvironment(name.to_string()))
    };
    let a = load(env_a)?;
    let b = load(env_b)?;

    let report = compare_packages(env_a, &a, env_b, &b);
    info!(
        "[drift] {} vs {}: {:.1}% similar, {} changed",
        env_a,
        env_b,
        report.similarity_percent,
        report.changed_versions.len()
    );
    Ok(report)
}

/// Name of the environment `target` was converted from.
///
/// `proj_forge` -> `proj`; a target without the suffix pairs with
/// `<target><source_suffix>` (the in-place backup).
pub fn paired_source_name(target: &str, target_suffix: &str, source_suffix: &str) -> String {
    match target.strip_suffix(target_suffix) {
        Some(stem) if !target_suffix.is_empty() && !stem.is_empty() => stem.to_string(),
        _ => format!("{}{}", target, source_suffix),
    }
}

/// Compare `target` with the environment it was converted from.
pub fn detect_drift(
    inventory: &Inventory,
    target: &str,
    target_suffix: &str,
    source_suffix: &str,
) -> Result<DriftReport, DriftError> {
    let source = paired_source_name(target, target_suffix, source_suffix);
    compare(inventory, &source, target)
}
