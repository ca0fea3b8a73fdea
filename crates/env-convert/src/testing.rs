//! In-memory package manager used by unit tests.
//!
//! `FakeConda` understands the subset of the command line that [`CondaCli`]
//! emits and keeps environments, installed packages and channel contents in a
//! mutex so it can be shared across the batch worker pool.
//!
//! [`CondaCli`]: crate::conda::CondaCli

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::runner::{CommandError, CommandOutput, CondaRunner};

pub const FAKE_ROOT: &str = "/opt/conda";

#[derive(Debug, Clone, Default)]
pub struct FakeEnv {
    pub conda: BTreeMap<String, String>,
    pub pip: BTreeMap<String, String>,
    pub history: Vec<String>,
}

#[derive(Default)]
struct State {
    envs: BTreeMap<String, FakeEnv>,
    channel: HashMap<String, Vec<String>>,
    broken: HashSet<String>,
    fail_patterns: Vec<String>,
    raw_outputs: HashMap<String, String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeConda {
    state: Mutex<State>,
}

fn failed(command: &str, stdout: &str, stderr: &str) -> CommandError {
    CommandError::Failed {
        command: command.to_string(),
        status: "exit status: 1".to_string(),
        code: Some(1),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

fn ok(stdout: impl Into<String>) -> Result<CommandOutput, CommandError> {
    Ok(CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
    })
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Environment addressed by `-n` or `-p`. Prefixes under the fake root map
/// back to their names; any other prefix is its own key.
fn target_env(args: &[String]) -> String {
    if let Some(name) = flag_value(args, "-n") {
        return name.to_string();
    }
    flag_value(args, "-p").map(resolve_prefix).unwrap_or_default()
}

fn resolve_prefix(prefix: &str) -> String {
    if prefix == FAKE_ROOT {
        return "base".to_string();
    }
    prefix
        .strip_prefix(&format!("{}/envs/", FAKE_ROOT))
        .unwrap_or(prefix)
        .to_string()
}

/// Positional specs after stripping the flags `CondaCli` adds.
fn positional_specs(args: &[String]) -> Vec<String> {
    let mut specs = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-n" | "-p" | "-c" | "--clone" => {
                iter.next();
            }
            "-y" | "--override-channels" | "--json" => {}
            other => specs.push(other.to_string()),
        }
    }
    specs
}

fn split_spec(spec: &str, separator: &str) -> (String, Option<String>) {
    match spec.split_once(separator) {
        Some((name, version)) => (name.to_string(), Some(version.to_string())),
        None => (spec.to_string(), None),
    }
}

impl FakeConda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment with conda packages installed. Each package is
    /// also recorded as explicitly requested.
    pub fn add_env(&self, name: &str, packages: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        let env = state.envs.entry(name.to_string()).or_default();
        for (pkg, version) in packages {
            env.conda.insert(pkg.to_string(), version.to_string());
            env.history.push(format!("{}={}", pkg, version));
        }
    }

    /// An environment the registry does not list, reachable only by prefix.
    pub fn add_prefix_env(&self, prefix: &std::path::Path, packages: &[(&str, &str)]) {
        self.add_env(&prefix.display().to_string(), packages);
    }

    pub fn add_pip(&self, env: &str, packages: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        let env = state.envs.entry(env.to_string()).or_default();
        for (pkg, version) in packages {
            env.pip.insert(pkg.to_string(), version.to_string());
        }
    }

    /// Override the explicitly requested specs reported by `--from-history`.
    pub fn set_history(&self, env: &str, specs: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let env = state.envs.entry(env.to_string()).or_default();
        env.history = specs.iter().map(|s| s.to_string()).collect();
    }

    /// Versions the target channel offers for `package`.
    pub fn set_channel_versions(&self, package: &str, versions: &[&str]) {
        self.state.lock().unwrap().channel.insert(
            package.to_string(),
            versions.iter().map(|v| v.to_string()).collect(),
        );
    }

    /// Any install command that includes `package` fails.
    pub fn break_package(&self, package: &str) {
        self.state.lock().unwrap().broken.insert(package.to_string());
    }

    /// Any command whose joined arguments contain `pattern` fails.
    pub fn fail_on(&self, pattern: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_patterns
            .push(pattern.to_string());
    }

    /// Return `stdout` verbatim for the exact joined command line.
    pub fn set_raw_output(&self, command: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .raw_outputs
            .insert(command.to_string(), stdout.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn has_env(&self, name: &str) -> bool {
        self.state.lock().unwrap().envs.contains_key(name)
    }

    pub fn env(&self, name: &str) -> Option<FakeEnv> {
        self.state.lock().unwrap().envs.get(name).cloned()
    }

    fn resolve_version(state: &State, name: &str, version: Option<String>) -> String {
        version.unwrap_or_else(|| {
            state
                .channel
                .get(name)
                .and_then(|v| v.last().cloned())
                .unwrap_or_else(|| "1.0".to_string())
        })
    }

    fn dispatch(
        state: &mut State,
        command: &str,
        args: &[String],
    ) -> Result<CommandOutput, CommandError> {
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["env", "list", ..] => {
                let mut envs = vec![FAKE_ROOT.to_string()];
                envs.extend(
                    state
                        .envs
                        .keys()
                        .filter(|n| n.as_str() != "base" && !n.starts_with('/'))
                        .map(|n| format!("{}/envs/{}", FAKE_ROOT, n)),
                );
                ok(serde_json::json!({ "envs": envs }).to_string())
            }
            ["list", ..] => {
                let name = target_env(args);
                let env = state.envs.get(&name).ok_or_else(|| {
                    failed(command, "", "EnvironmentLocationNotFound: Not a conda environment")
                })?;
                let mut packages = Vec::new();
                for (pkg, version) in &env.conda {
                    packages.push(serde_json::json!({
                        "name": pkg, "version": version,
                        "channel": "pkgs/main", "build": "h0_0",
                    }));
                }
                for (pkg, version) in &env.pip {
                    packages.push(serde_json::json!({
                        "name": pkg, "version": version,
                        "channel": "pypi", "build": "pypi_0",
                    }));
                }
                ok(serde_json::Value::Array(packages).to_string())
            }
            ["env", "export", ..] => {
                let name = target_env(args);
                let env = state
                    .envs
                    .get(&name)
                    .ok_or_else(|| failed(command, "", "EnvironmentLocationNotFound"))?;
                let mut lines = Vec::new();
                if words.contains(&"--from-history") {
                    lines.extend(env.history.iter().map(|spec| format!("  - {}", spec)));
                } else {
                    for (pkg, version) in &env.conda {
                        lines.push(format!("  - {}={}=h0_0", pkg, version));
                    }
                    if !env.pip.is_empty() {
                        lines.push("  - pip:".to_string());
                        for (pkg, version) in &env.pip {
                            lines.push(format!("    - {}=={}", pkg, version));
                        }
                    }
                }
                let mut yaml = format!("name: {}\nchannels:\n  - defaults\n", name);
                if lines.is_empty() {
                    yaml.push_str("dependencies: []\n");
                } else {
                    yaml.push_str("dependencies:\n");
                    yaml.push_str(&lines.join("\n"));
                    yaml.push('\n');
                }
                yaml.push_str(&format!("prefix: {}/envs/{}\n", FAKE_ROOT, name));
                ok(yaml)
            }
            ["env", "remove", ..] => {
                let name = flag_value(args, "-n").unwrap_or_default();
                match state.envs.remove(name) {
                    Some(_) => ok(""),
                    None => Err(failed(command, "", "EnvironmentLocationNotFound")),
                }
            }
            ["create", ..] => {
                let name = flag_value(args, "-n").unwrap_or_default().to_string();
                if state.envs.contains_key(&name) {
                    return Err(failed(command, "", "CondaValueError: prefix already exists"));
                }
                if let Some(source) = flag_value(args, "--clone") {
                    let env = state
                        .envs
                        .get(&resolve_prefix(source))
                        .cloned()
                        .ok_or_else(|| failed(command, "", "PackagesNotFoundError: no source"))?;
                    state.envs.insert(name, env);
                    return ok("");
                }
                let specs = positional_specs(args);
                Self::install_specs(state, command, &specs)?;
                let mut env = FakeEnv::default();
                for spec in specs {
                    let (pkg, version) = split_spec(&spec, "=");
                    let version = Self::resolve_version(state, &pkg, version);
                    env.history.push(spec.clone());
                    env.conda.insert(pkg, version);
                }
                state.envs.insert(name, env);
                ok("")
            }
            ["install", ..] => {
                let name = flag_value(args, "-n").unwrap_or_default().to_string();
                if !state.envs.contains_key(&name) {
                    return Err(failed(command, "", "EnvironmentLocationNotFound"));
                }
                let specs = positional_specs(args);
                Self::install_specs(state, command, &specs)?;
                let resolved: Vec<(String, String, String)> = specs
                    .iter()
                    .map(|spec| {
                        let (pkg, version) = split_spec(spec, "=");
                        let version = Self::resolve_version(state, &pkg, version);
                        (spec.clone(), pkg, version)
                    })
                    .collect();
                if let Some(env) = state.envs.get_mut(&name) {
                    for (spec, pkg, version) in resolved {
                        env.history.push(spec);
                        env.conda.insert(pkg, version);
                    }
                }
                ok("")
            }
            ["run", ..] => {
                let name = flag_value(args, "-n").unwrap_or_default().to_string();
                if !state.envs.contains_key(&name) {
                    return Err(failed(command, "", "EnvironmentLocationNotFound"));
                }
                let specs: Vec<String> = args
                    .iter()
                    .skip_while(|a| a.as_str() != "--no-input")
                    .skip(1)
                    .cloned()
                    .collect();
                Self::install_specs(state, command, &specs)?;
                if let Some(env) = state.envs.get_mut(&name) {
                    for spec in specs {
                        let (pkg, version) = split_spec(&spec, "==");
                        env.pip
                            .insert(pkg, version.unwrap_or_else(|| "1.0".to_string()));
                    }
                }
                ok("")
            }
            ["search", ..] => {
                let package = args.last().cloned().unwrap_or_default();
                match state.channel.get(&package) {
                    Some(versions) => {
                        let hits: Vec<_> = versions
                            .iter()
                            .map(|v| serde_json::json!({ "name": package, "version": v }))
                            .collect();
                        let mut payload = serde_json::Map::new();
                        payload.insert(package.clone(), serde_json::Value::Array(hits));
                        ok(serde_json::Value::Object(payload).to_string())
                    }
                    None => Err(failed(
                        command,
                        r#"{"exception_name": "PackagesNotFoundError"}"#,
                        "",
                    )),
                }
            }
            _ => Err(failed(command, "", "unsupported command")),
        }
    }

    fn install_specs(state: &State, command: &str, specs: &[String]) -> Result<(), CommandError> {
        for spec in specs {
            let name = spec.split('=').next().unwrap_or(spec);
            if state.broken.contains(name) {
                return Err(failed(
                    command,
                    "",
                    &format!("PackagesNotFoundError: {} is not available", name),
                ));
            }
        }
        Ok(())
    }
}

impl CondaRunner for FakeConda {
    fn run(&self, args: &[String]) -> Result<CommandOutput, CommandError> {
        let command = args.join(" ");
        let mut state = self.state.lock().unwrap();
        state.calls.push(command.clone());

        if let Some(raw) = state.raw_outputs.get(&command) {
            return ok(raw.clone());
        }
        if state.fail_patterns.iter().any(|p| command.contains(p.as_str())) {
            return Err(failed(&command, "", "injected failure"));
        }
        Self::dispatch(&mut state, &command, args)
    }
}
