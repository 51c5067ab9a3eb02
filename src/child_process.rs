//! A uniform subprocess runner used by [`crate::git::GitDeploymentTracker`],
//! the external test runner invocation, and the functions deployer.
//!
//! Arguments are always passed as an array — never interpolated into a
//! shell string — so nothing here is vulnerable to shell injection from
//! untrusted path or identifier components.

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::DeployError;

/// The outcome of a subprocess invocation that exited (as opposed to one
/// that timed out, which is reported as a [`DeployError::Timeout`]
/// before a `ProcessOutput` is ever constructed).
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Options for a single invocation. `cwd` and `env` default to the
/// parent process's; `timeout` has no default — callers must pick one
/// appropriate to the command (git ≈ 10-30s, tests ≈ 5min,
/// function deploy ≈ 2min).
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cwd: Option<std::path::PathBuf>,
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
}

impl ExecuteOptions {
    pub fn with_cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Runs commands with captured output, an explicit timeout, and typed
/// errors. Stateless: a plain marker struct, no fields to hold.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChildProcess;

impl ChildProcess {
    pub fn new() -> Self {
        Self
    }

    /// Spawns `command` with `args`, waits for exit (or the configured
    /// timeout), and returns the captured output. A nonzero exit code is
    /// not itself an error here — callers decide whether that is fatal;
    /// [`ProcessOutput::success`] reports it.
    pub async fn execute<I, S>(
        &self,
        command: &str,
        args: I,
        options: ExecuteOptions,
    ) -> Result<ProcessOutput, DeployError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(command);
        cmd.args(args);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(true);

        let run = cmd.output();
        let output = match options.timeout {
            Some(duration) => match timeout(duration, run).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(DeployError::Timeout {
                        command: command.to_string(),
                        timeout_secs: duration.as_secs(),
                    });
                }
            },
            None => run.await?,
        };

        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    /// Runs `command` and turns a nonzero exit into a
    /// [`DeployError::Subprocess`], for callers that treat any failure as
    /// fatal.
    pub async fn execute_checked<I, S>(
        &self,
        command: &str,
        args: I,
        options: ExecuteOptions,
    ) -> Result<ProcessOutput, DeployError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.execute(command, args, options).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(DeployError::Subprocess {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }
}
