//! Typed wrapper around the package-manager command line.
//!
//! The JSON and YAML the manager prints are treated as untrusted input: a
//! non-zero exit, an empty payload, or anything that fails to parse is logged
//! and mapped to `None`. Mutating commands (`create`, `install`, ...) return
//! the raw [`CommandError`] so the caller can record why they failed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::package_spec::DependencyEntry;
use crate::runner::{CommandError, CommandOutput, CondaRunner};

/// Channel name the manager reports for pip-installed packages.
pub const PYPI_CHANNEL: &str = "pypi";

/// A package as reported by `conda list --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub build: String,
}

impl InstalledPackage {
    pub fn is_pip(&self) -> bool {
        self.channel == PYPI_CHANNEL
    }
}

/// Parsed `conda env export` output.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentExport {
    pub name: Option<String>,
    pub channels: Vec<String>,
    pub dependencies: Vec<DependencyEntry>,
    /// The YAML exactly as the manager printed it.
    pub raw: String,
}

// Raw JSON / YAML structures for parsing

#[derive(Debug, Deserialize)]
struct RawEnvList {
    #[serde(default)]
    envs: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawExport {
    name: Option<String>,
    channels: Option<Vec<String>>,
    dependencies: Option<Vec<serde_yaml::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawSearchHit {
    version: String,
}

/// How an environment is addressed on the manager's command line.
///
/// Registered environments can be named; anything found only on disk must be
/// addressed by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvTarget<'a> {
    Name(&'a str),
    Prefix(&'a Path),
}

impl EnvTarget<'_> {
    fn args(&self) -> [String; 2] {
        match self {
            EnvTarget::Name(name) => ["-n".to_string(), name.to_string()],
            EnvTarget::Prefix(path) => ["-p".to_string(), path.display().to_string()],
        }
    }
}

impl fmt::Display for EnvTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvTarget::Name(name) => f.write_str(name),
            EnvTarget::Prefix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl<'a> From<&'a str> for EnvTarget<'a> {
    fn from(name: &'a str) -> Self {
        EnvTarget::Name(name)
    }
}

impl<'a> From<&'a String> for EnvTarget<'a> {
    fn from(name: &'a String) -> Self {
        EnvTarget::Name(name)
    }
}

impl<'a> From<&'a Path> for EnvTarget<'a> {
    fn from(path: &'a Path) -> Self {
        EnvTarget::Prefix(path)
    }
}

impl<'a> From<&'a PathBuf> for EnvTarget<'a> {
    fn from(path: &'a PathBuf) -> Self {
        EnvTarget::Prefix(path)
    }
}

fn to_args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Package-manager adapter shared by every component.
#[derive(Clone)]
pub struct CondaCli {
    runner: Arc<dyn CondaRunner>,
    channels: Vec<String>,
}

impl CondaCli {
    /// Create an adapter installing from conda-forge.
    pub fn new(runner: Arc<dyn CondaRunner>) -> Self {
        Self {
            runner,
            channels: vec!["conda-forge".to_string()],
        }
    }

    /// Replace the channels used by `create`, `install` and `search`.
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        if !channels.is_empty() {
            self.channels = channels;
        }
        self
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn manager_name(&self) -> &str {
        self.runner.manager_name()
    }

    fn run(&self, args: Vec<String>) -> Result<CommandOutput, CommandError> {
        self.runner.run(&args)
    }

    fn channel_args(&self) -> Vec<String> {
        let mut args = vec!["--override-channels".to_string()];
        for channel in &self.channels {
            args.push("-c".to_string());
            args.push(channel.clone());
        }
        args
    }

    /// Absolute paths of every environment the manager knows about.
    pub fn env_list(&self) -> Option<Vec<PathBuf>> {
        let output = match self.run(to_args(&["env", "list", "--json"])) {
            Ok(output) => output,
            Err(e) => {
                error!("[conda] Failed to list environments: {}", e);
                return None;
            }
        };
        if output.stdout.trim().is_empty() {
            warn!("[conda] Environment list was empty");
            return None;
        }
        match serde_json::from_str::<RawEnvList>(&output.stdout) {
            Ok(list) => Some(list.envs),
            Err(e) => {
                error!("[conda] Could not parse environment list: {}", e);
                None
            }
        }
    }

    /// Installed packages of `env`, conda and pip origin alike.
    pub fn list_packages<'a>(&self, env: impl Into<EnvTarget<'a>>) -> Option<Vec<InstalledPackage>> {
        let env = env.into();
        let mut args = to_args(&["list"]);
        args.extend(env.args());
        args.push("--json".to_string());
        let output = match self.run(args) {
            Ok(output) => output,
            Err(e) => {
                error!("[conda] Failed to list packages of {}: {}", env, e);
                return None;
            }
        };
        if output.stdout.trim().is_empty() {
            warn!("[conda] Package list of {} was empty", env);
            return None;
        }
        match serde_json::from_str::<Vec<InstalledPackage>>(&output.stdout) {
            Ok(packages) => Some(packages),
            Err(e) => {
                error!("[conda] Could not parse package list of {}: {}", env, e);
                None
            }
        }
    }

    /// Raw `env export` YAML.
    ///
    /// With `from_history` only the packages the user asked for are exported.
    pub fn export_raw<'a>(&self, env: impl Into<EnvTarget<'a>>, from_history: bool) -> Option<String> {
        let env = env.into();
        let mut args = to_args(&["env", "export"]);
        args.extend(env.args());
        if from_history {
            args.push("--from-history".to_string());
        }
        match self.run(args) {
            Ok(output) if !output.stdout.trim().is_empty() => Some(output.stdout),
            Ok(_) => {
                warn!("[conda] Export of {} produced no output", env);
                None
            }
            Err(e) => {
                error!("[conda] Failed to export {}: {}", env, e);
                None
            }
        }
    }

    /// Parsed `env export`.
    pub fn export<'a>(&self, env: impl Into<EnvTarget<'a>>, from_history: bool) -> Option<EnvironmentExport> {
        let env = env.into();
        let raw = self.export_raw(env, from_history)?;
        parse_export(&raw).or_else(|| {
            error!("[conda] Could not parse export of {}", env);
            None
        })
    }

    /// Create `name` with the given python and any extra specs.
    pub fn create(
        &self,
        name: &str,
        python: Option<&str>,
        extra_specs: &[String],
    ) -> Result<(), CommandError> {
        let mut args = to_args(&["create", "-n", name, "-y"]);
        args.extend(self.channel_args());
        match python {
            Some(version) => args.push(format!("python={}", version)),
            None => args.push("python".to_string()),
        }
        args.extend(extra_specs.iter().cloned());
        self.run(args).map(|_| ())
    }

    /// Install conda specs into `env` with a single command.
    pub fn install(&self, env: &str, specs: &[String]) -> Result<(), CommandError> {
        let mut args = to_args(&["install", "-n", env, "-y"]);
        args.extend(self.channel_args());
        args.extend(specs.iter().cloned());
        self.run(args).map(|_| ())
    }

    /// Install pip requirements into `env` using the environment's own pip.
    pub fn pip_install(&self, env: &str, specs: &[String]) -> Result<(), CommandError> {
        let mut args = to_args(&[
            "run", "-n", env, "python", "-m", "pip", "install", "--no-input",
        ]);
        args.extend(specs.iter().cloned());
        self.run(args).map(|_| ())
    }

    /// Clone `source` into a new environment `target`.
    ///
    /// `source` may be a name or a prefix; cloning by prefix works for
    /// environments the registry does not know about.
    pub fn clone_env<'a>(
        &self,
        source: impl Into<EnvTarget<'a>>,
        target: &str,
    ) -> Result<(), CommandError> {
        let source = match source.into() {
            EnvTarget::Name(name) => name.to_string(),
            EnvTarget::Prefix(path) => path.display().to_string(),
        };
        self.run(to_args(&["create", "-n", target, "--clone", &source, "-y"]))
            .map(|_| ())
    }

    /// Remove the environment `name` entirely.
    pub fn remove_env(&self, name: &str) -> Result<(), CommandError> {
        self.run(to_args(&["env", "remove", "-n", name, "-y"]))
            .map(|_| ())
    }

    /// Versions of `package` available in the configured channels.
    ///
    /// Returns `Some(vec![])` when the manager reports the package does not
    /// exist and `None` when the lookup itself failed.
    pub fn search(&self, package: &str) -> Option<Vec<String>> {
        let mut args = to_args(&["search", "--json"]);
        args.extend(self.channel_args());
        args.push(package.to_string());

        let output = match self.run(args) {
            Ok(output) => output,
            Err(e) if e.output_text().contains("PackagesNotFound") => return Some(Vec::new()),
            Err(e) => {
                error!("[conda] Search for {} failed: {}", package, e);
                return None;
            }
        };

        let hits: std::collections::HashMap<String, Vec<RawSearchHit>> =
            match serde_json::from_str(&output.stdout) {
                Ok(hits) => hits,
                Err(e) => {
                    error!("[conda] Could not parse search results for {}: {}", package, e);
                    return None;
                }
            };

        let mut versions: Vec<String> = hits
            .get(package)
            .map(|hits| hits.iter().map(|h| h.version.clone()).collect())
            .unwrap_or_default();
        versions.dedup();
        Some(versions)
    }
}

/// Parse `env export` YAML into typed dependency entries.
pub fn parse_export(raw: &str) -> Option<EnvironmentExport> {
    let parsed: RawExport = serde_yaml::from_str(raw).ok()?;
    let dependencies = parsed
        .dependencies
        .unwrap_or_default()
        .iter()
        .filter_map(DependencyEntry::from_yaml)
        .collect();

    Some(EnvironmentExport {
        name: parsed.name,
        channels: parsed.channels.unwrap_or_default(),
        dependencies,
        raw: raw.to_string(),
    })
}
