//! Subprocess layer for the external package manager.
//!
//! Every call into `conda`/`mamba` goes through [`CondaRunner::run`], which
//! blocks until the process exits and returns either its captured output or a
//! [`CommandError`]. Callers match on the result; nothing here panics on a
//! misbehaving tool.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info};

/// Managers tried on PATH when none is configured, in preference order.
pub const DEFAULT_MANAGERS: &[&str] = &["mamba", "conda"];

/// Captured output of a successful package-manager invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Why a package-manager invocation did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("package manager not found: {0}")]
    NotFound(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// Combined captured output, for callers that need to inspect why a
    /// command failed.
    pub fn output_text(&self) -> String {
        match self {
            CommandError::Failed { stdout, stderr, .. } => format!("{stdout}\n{stderr}"),
            other => other.to_string(),
        }
    }
}

/// Executes package-manager commands.
///
/// Implementations must be shareable across the batch worker pool.
pub trait CondaRunner: Send + Sync {
    /// Run the manager with `args` and wait for it to exit.
    fn run(&self, args: &[String]) -> Result<CommandOutput, CommandError>;

    /// Short name of the manager (`conda`, `mamba`) for log lines.
    fn manager_name(&self) -> &str {
        "conda"
    }
}

/// Runs a real `conda` or `mamba` executable.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    name: String,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "conda".to_string());
        Self { program, name }
    }

    /// Find a usable manager on PATH, preferring mamba.
    pub fn detect() -> Result<Self, CommandError> {
        for candidate in DEFAULT_MANAGERS {
            if responds(Path::new(candidate)) {
                info!("[runner] Using {} from PATH", candidate);
                return Ok(Self::new(*candidate));
            }
        }
        Err(CommandError::NotFound(DEFAULT_MANAGERS.join(" or ")))
    }

    /// Use `program` if given, otherwise [`ProcessRunner::detect`].
    pub fn from_setting(program: Option<&Path>) -> Result<Self, CommandError> {
        match program {
            Some(p) if responds(p) => Ok(Self::new(p)),
            Some(p) => Err(CommandError::NotFound(p.display().to_string())),
            None => Self::detect(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Check that `program --version` runs and exits cleanly.
fn responds(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

impl CondaRunner for ProcessRunner {
    fn run(&self, args: &[String]) -> Result<CommandOutput, CommandError> {
        let command = format!("{} {}", self.name, args.join(" "));
        debug!("[runner] {}", command);

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CommandError::NotFound(self.program.display().to_string())
                } else {
                    CommandError::Spawn {
                        program: self.program.display().to_string(),
                        source: e,
                    }
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(CommandError::Failed {
                command,
                status: output.status.to_string(),
                code: output.status.code(),
                stdout,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    fn manager_name(&self) -> &str {
        &self.name
    }
}
