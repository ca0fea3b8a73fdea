//! Typed package specifications.
//!
//! Raw dependency lists come from `conda env export` and mix plain conda specs
//! (`numpy=1.24`) with a single nested `pip:` group. This module turns them
//! into [`PackageSpec`] values split by origin.

use serde::{Deserialize, Serialize};

/// Separator between name and version in conda specs.
pub const CONDA_VERSION_SEPARATOR: char = '=';

/// Separator between name and version in pip requirement strings.
pub const PIP_VERSION_SEPARATOR: &str = "==";

/// One entry of a `dependencies:` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyEntry {
    /// A conda spec string such as `numpy=1.24`.
    PlainSpec(String),
    /// The nested `- pip: [...]` group.
    PipGroup(Vec<String>),
}

impl DependencyEntry {
    /// Convert one raw YAML list item. Mappings other than `pip:` and
    /// non-string scalars are dropped.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<Self> {
        match value {
            serde_yaml::Value::String(s) => Some(Self::PlainSpec(s.clone())),
            serde_yaml::Value::Mapping(map) => {
                let pip = map.get(serde_yaml::Value::String("pip".to_string()))?;
                let serde_yaml::Value::Sequence(items) = pip else {
                    return None;
                };
                let specs = items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect();
                Some(Self::PipGroup(specs))
            }
            _ => None,
        }
    }
}

/// Which installer a package came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageOrigin {
    Conda,
    Pip,
}

impl std::fmt::Display for PackageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageOrigin::Conda => write!(f, "conda"),
            PackageOrigin::Pip => write!(f, "pip"),
        }
    }
}

/// A package name with an optional version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: Option<String>,
    pub origin: PackageOrigin,
}

impl PackageSpec {
    pub fn conda(name: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            name: name.into(),
            version: version.map(str::to_string),
            origin: PackageOrigin::Conda,
        }
    }

    pub fn pip(name: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            name: name.into(),
            version: version.map(str::to_string),
            origin: PackageOrigin::Pip,
        }
    }

    /// Version without a trailing build string (`1.24.3=py311h` -> `1.24.3`).
    pub fn base_version(&self) -> Option<&str> {
        self.version
            .as_deref()
            .map(|v| v.split(CONDA_VERSION_SEPARATOR).next().unwrap_or(v))
            .filter(|v| !v.is_empty())
    }

    /// The argument handed to the installer for this package.
    ///
    /// Build strings are dropped because they are channel specific.
    pub fn install_spec(&self) -> String {
        match (self.origin, self.base_version()) {
            (PackageOrigin::Conda, Some(v)) => format!("{}={}", self.name, v),
            (PackageOrigin::Pip, Some(v)) => format!("{}{}{}", self.name, PIP_VERSION_SEPARATOR, v),
            (_, None) => self.name.clone(),
        }
    }
}

impl std::fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} {}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Split a conda spec on the first `=` only.
///
/// Exported specs look like `numpy=1.24.3=py311h64a7726_0`; everything after
/// the first separator is kept as the version.
pub fn parse_conda_spec(raw: &str) -> Option<PackageSpec> {
    let raw = raw.trim();
    let (name, version) = match raw.split_once(CONDA_VERSION_SEPARATOR) {
        Some((name, version)) => (name.trim(), Some(version.trim())),
        None => (raw, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(PackageSpec::conda(name, version.filter(|v| !v.is_empty())))
}

/// Split a pip requirement on `==`.
pub fn parse_pip_spec(raw: &str) -> Option<PackageSpec> {
    let raw = raw.trim();
    let (name, version) = match raw.split_once(PIP_VERSION_SEPARATOR) {
        Some((name, version)) => (name.trim(), Some(version.trim())),
        None => (raw, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(PackageSpec::pip(name, version.filter(|v| !v.is_empty())))
}

/// Normalize a dependency list into conda-origin and pip-origin packages.
///
/// - the manager's own `pip` entry and the bare `python=` pseudo-entry are dropped
/// - the `pip:` group contributes pip-origin packages
/// - `python`, when present, is moved to the front of the conda list so that
///   environment creation pins it first
pub fn extract_package_specs(
    dependencies: &[DependencyEntry],
) -> (Vec<PackageSpec>, Vec<PackageSpec>) {
    let mut conda_packages = Vec::new();
    let mut pip_packages = Vec::new();

    for entry in dependencies {
        match entry {
            DependencyEntry::PlainSpec(raw) => {
                let raw = raw.trim();
                if raw == "pip" || raw == "python=" {
                    continue;
                }
                if let Some(spec) = parse_conda_spec(raw) {
                    conda_packages.push(spec);
                }
            }
            DependencyEntry::PipGroup(items) => {
                pip_packages.extend(items.iter().map(String::as_str).filter_map(parse_pip_spec));
            }
        }
    }

    if let Some(idx) = conda_packages.iter().position(|p| p.name == "python") {
        let python = conda_packages.remove(idx);
        conda_packages.insert(0, python);
    }

    (conda_packages, pip_packages)
}

/// Reduce a python version to `major.minor`.
///
/// - "3.11.5" -> "3.11"
/// - "3.11.5=h955ad1f_0" -> "3.11"
/// - "3.10.*" -> "3.10"
/// - "3" -> "3"
pub fn python_minor_version(version: &str) -> Option<String> {
    let version = version
        .split(CONDA_VERSION_SEPARATOR)
        .next()
        .unwrap_or(version)
        .trim()
        .trim_end_matches(".*");

    let parts: Vec<&str> = version.split('.').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [] => None,
        [major] => Some(major.to_string()),
        [major, minor, ..] => Some(format!("{}.{}", major, minor)),
    }
}
