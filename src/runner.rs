//! External process invocation
//!
//! All cluster, DNS, and repository work happens through external tools
//! (`gcloud`, `kubectl`, `aws`, `git`, `openssl`). This module owns the one
//! narrow seam those invocations pass through: a command vector, an optional
//! working directory, a captured-output flag, and an exit-tolerance flag.
//! Orchestration logic is tested against a fake [`CommandRunner`] instead of
//! the real tools.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::Mutex;

use tracing::info;

use crate::error::Error;
use crate::Result;

/// Command output for testability
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the command exited zero
    pub success: bool,
    /// Standard output (empty unless captured)
    pub stdout: String,
    /// Standard error (empty unless captured)
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Options for a single invocation
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    /// Working directory for the child process
    pub dir: Option<PathBuf>,
    /// Capture stdout/stderr instead of inheriting the terminal
    pub capture: bool,
    /// Treat a non-zero exit as an error (status probes set this to false)
    pub check: bool,
}

impl RunOpts {
    /// Options for a required step: fail on non-zero exit
    pub fn checked() -> Self {
        Self {
            check: true,
            ..Default::default()
        }
    }

    /// Options for a status query: capture output, tolerate non-zero exit
    pub fn probe() -> Self {
        Self {
            capture: true,
            ..Default::default()
        }
    }

    /// Capture stdout/stderr
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Tolerate a non-zero exit
    pub fn tolerate_failure(mut self) -> Self {
        self.check = false;
        self
    }

    /// Run in the given working directory
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }
}

/// Trait for executing external commands (allows mocking in tests)
pub trait CommandRunner: Send + Sync {
    /// Execute the command vector with the given options.
    ///
    /// When `opts.check` is set a non-zero exit becomes
    /// [`Error::CommandFailed`]; otherwise the caller inspects
    /// [`CommandOutput::success`].
    fn run(&self, argv: &[String], opts: &RunOpts) -> Result<CommandOutput>;
}

/// Build an owned command vector from string literals
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Real command runner that executes actual system commands.
///
/// Resolved executable paths are cached per runner instance, not
/// process-wide, so unrelated runs never share stale lookups.
#[derive(Debug, Default)]
pub struct ProcessRunner {
    executables: Mutex<HashMap<String, PathBuf>>,
}

impl ProcessRunner {
    /// Create a runner with an empty executable cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify that every listed tool is on the search path, caching the
    /// resolved paths. Fails before any external side effect.
    pub fn check_prerequisites(&self, tools: &[&str]) -> Result<()> {
        let mut cache = self.executables.lock().expect("executable cache poisoned");
        for tool in tools {
            if cache.contains_key(*tool) {
                continue;
            }
            let path = which::which(tool).map_err(|_| Error::PrerequisiteNotFound {
                tool: tool.to_string(),
                hint: install_hint(tool).to_string(),
            })?;
            cache.insert(tool.to_string(), path);
        }
        Ok(())
    }

    fn resolve(&self, program: &str) -> PathBuf {
        let cache = self.executables.lock().expect("executable cache poisoned");
        cache
            .get(program)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(program))
    }
}

fn install_hint(tool: &str) -> &'static str {
    match tool {
        "gcloud" => "install the Google Cloud SDK: https://cloud.google.com/sdk/docs/install",
        "kubectl" => "install kubectl: https://kubernetes.io/docs/tasks/tools/",
        "aws" => "install the AWS CLI: https://docs.aws.amazon.com/cli/",
        "git" => "install git: https://git-scm.com/downloads",
        "openssl" => "install openssl, or supply 'tls_dhparam' to skip DH generation",
        _ => "install it and ensure it is on PATH",
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, argv: &[String], opts: &RunOpts) -> Result<CommandOutput> {
        let program = argv
            .first()
            .ok_or_else(|| Error::command_failed("<empty>", "empty command vector"))?;
        let command_line = argv.join(" ");
        info!(command = %command_line, "running");

        let mut cmd = Command::new(self.resolve(program));
        cmd.args(&argv[1..]);
        if let Some(dir) = &opts.dir {
            cmd.current_dir(dir);
        }
        if opts.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let output = CommandOutput::from(cmd.output()?);
        if opts.check && !output.success {
            return Err(Error::CommandFailed {
                command: command_line,
                message: if output.stderr.is_empty() {
                    "non-zero exit".to_string()
                } else {
                    output.stderr.trim().to_string()
                },
            });
        }
        Ok(output)
    }
}
