//! Environment discovery and package extraction.
//!
//! Environments come from two places: the package manager's own registry
//! (`conda env list`) and a bounded filesystem walk of extra search paths.
//! Registry entries always win a name clash; filesystem hits that collide
//! with an existing name at a different path get a numeric suffix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::conda::{CondaCli, EnvTarget, InstalledPackage};
use crate::package_spec::{
    extract_package_specs, python_minor_version, DependencyEntry, PackageSpec,
};

/// Directory names that identify the root install rather than a named env.
const ROOT_INSTALL_NAMES: &[&str] = &[
    "anaconda3",
    "anaconda",
    "miniconda3",
    "miniconda",
    "miniforge3",
    "mambaforge",
    "micromamba",
    "conda",
];

/// A discovered environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub name: String,
    pub path: PathBuf,
}

/// Everything the conversion engine needs to know about a source environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub name: String,
    pub path: Option<PathBuf>,
    pub python_version: Option<String>,
    pub conda_packages: Vec<PackageSpec>,
    pub pip_packages: Vec<PackageSpec>,
    /// True when the package lists came from the explicit install history
    /// rather than a full transitive export.
    pub explicit_only: bool,
}

/// Installed packages split by origin.
#[derive(Debug, Clone, Default)]
pub struct InstalledPackages {
    pub conda: Vec<InstalledPackage>,
    pub pip: Vec<InstalledPackage>,
}

impl InstalledPackages {
    /// Conda-origin packages as `name -> version`.
    pub fn conda_versions(&self) -> BTreeMap<String, String> {
        self.conda
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect()
    }

    pub fn python_version(&self) -> Option<&str> {
        self.conda
            .iter()
            .find(|p| p.name == "python")
            .map(|p| p.version.as_str())
    }
}

/// Name an environment from its registry path.
///
/// `.../envs/<name>` is a named environment; a root install directory is
/// `base`.
pub fn registry_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "base".to_string());

    let under_envs = path
        .parent()
        .and_then(|p| p.file_name())
        .is_some_and(|p| p == "envs");
    if under_envs {
        return file_name;
    }
    if ROOT_INSTALL_NAMES.contains(&file_name.to_lowercase().as_str()) {
        return "base".to_string();
    }
    file_name
}

/// Whether `path` looks like a conda environment: it has `conda-meta/` and
/// either an interpreter or a standard binary directory.
pub fn is_environment_dir(path: &Path) -> bool {
    if !path.join("conda-meta").is_dir() {
        return false;
    }
    path.join("bin").join("python").exists()
        || path.join("python.exe").exists()
        || path.join("bin").is_dir()
        || path.join("Scripts").is_dir()
}

/// Insert `path` under `name`, appending `_1`, `_2`, ... when the name is
/// already taken by a different path. Returns the name actually used, or
/// `None` if the path was already present.
fn insert_unique(
    envs: &mut BTreeMap<String, PathBuf>,
    name: String,
    path: PathBuf,
) -> Option<String> {
    if envs.values().any(|p| *p == path) {
        return None;
    }
    let mut candidate = name.clone();
    let mut counter = 1;
    while envs.contains_key(&candidate) {
        candidate = format!("{}_{}", name, counter);
        counter += 1;
    }
    envs.insert(candidate.clone(), path);
    Some(candidate)
}

/// Walk `root` up to `max_depth` levels, collecting environment directories.
///
/// Recursion stops at a directory that qualifies, so nested `envs/` inside a
/// found environment are not reported twice.
pub fn scan_directory(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(root).max_depth(max_depth).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("[inventory] Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if is_environment_dir(entry.path()) {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }

    found
}

/// Discovery and extraction over a [`CondaCli`].
#[derive(Clone)]
pub struct Inventory {
    conda: CondaCli,
}

impl Inventory {
    pub fn new(conda: CondaCli) -> Self {
        Self { conda }
    }

    pub fn conda(&self) -> &CondaCli {
        &self.conda
    }

    /// Find every environment, keyed by unique name.
    pub fn discover(&self, extra_paths: &[PathBuf], max_depth: usize) -> BTreeMap<String, PathBuf> {
        let mut envs = BTreeMap::new();

        match self.conda.env_list() {
            Some(paths) => {
                for path in paths {
                    insert_unique(&mut envs, registry_name(&path), path);
                }
            }
            None => warn!("[inventory] Registry unavailable, relying on filesystem scan"),
        }

        for root in extra_paths {
            if !root.is_dir() {
                debug!("[inventory] Search path {:?} does not exist", root);
                continue;
            }
            for path in scan_directory(root, max_depth) {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "env".to_string());
                if let Some(used) = insert_unique(&mut envs, name.clone(), path.clone()) {
                    if used != name {
                        info!("[inventory] {:?} renamed to {} to avoid a clash", path, used);
                    }
                }
            }
        }

        info!("[inventory] Discovered {} environments", envs.len());
        envs
    }

    /// Discovered environments as records, sorted by name.
    pub fn records(&self, extra_paths: &[PathBuf], max_depth: usize) -> Vec<EnvironmentRecord> {
        self.discover(extra_paths, max_depth)
            .into_iter()
            .map(|(name, path)| EnvironmentRecord { name, path })
            .collect()
    }

    /// Whether the package manager knows an environment called `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.conda
            .env_list()
            .unwrap_or_default()
            .iter()
            .any(|p| registry_name(p) == name)
    }

    /// Dependency list of `env` and whether it is explicit-only.
    ///
    /// The history view is tried first; if it is unavailable or empty the
    /// full export is used instead.
    pub fn extract_packages<'a>(
        &self,
        env: impl Into<EnvTarget<'a>>,
    ) -> Option<(Vec<DependencyEntry>, bool)> {
        let env = env.into();
        if let Some(export) = self.conda.export(env, true) {
            if !export.dependencies.is_empty() {
                return Some((export.dependencies, true));
            }
        }

        warn!(
            "[inventory] No install history for {}, falling back to full export",
            env
        );
        self.conda
            .export(env, false)
            .map(|export| (export.dependencies, false))
    }

    /// Installed packages of `env` split into conda and pip origin.
    pub fn installed_packages<'a>(&self, env: impl Into<EnvTarget<'a>>) -> Option<InstalledPackages> {
        let packages = self.conda.list_packages(env)?;
        let (pip, conda): (Vec<_>, Vec<_>) = packages.into_iter().partition(|p| p.is_pip());
        Some(InstalledPackages { conda, pip })
    }

    /// Build [`EnvironmentInfo`] for `name`. Absent when no dependencies can
    /// be determined.
    ///
    /// When `path` is known the manager is addressed by prefix, so
    /// environments found only on disk resolve too.
    pub fn environment_info(&self, name: &str, path: Option<&Path>) -> Option<EnvironmentInfo> {
        let env = path.map_or(EnvTarget::Name(name), EnvTarget::Prefix);
        let (dependencies, explicit_only) = self.extract_packages(env)?;
        if dependencies.is_empty() {
            warn!("[inventory] {} has no dependencies to convert", name);
            return None;
        }

        let (conda_packages, mut pip_packages) = extract_package_specs(&dependencies);

        let mut python_version = conda_packages
            .iter()
            .find(|p| p.name == "python")
            .and_then(|p| p.base_version())
            .and_then(python_minor_version);

        // The history view omits pip packages and often the python pin.
        if explicit_only || python_version.is_none() {
            if let Some(installed) = self.installed_packages(env) {
                if python_version.is_none() {
                    python_version = installed.python_version().and_then(python_minor_version);
                }
                if explicit_only && pip_packages.is_empty() {
                    pip_packages = installed
                        .pip
                        .iter()
                        .map(|p| PackageSpec::pip(&p.name, Some(&p.version)))
                        .collect();
                }
            }
        }

        Some(EnvironmentInfo {
            name: name.to_string(),
            path: path.map(Path::to_path_buf),
            python_version,
            conda_packages,
            pip_packages,
            explicit_only,
        })
    }
}
