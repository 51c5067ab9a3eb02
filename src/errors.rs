//! Error types for the `data-deploy` crate.
//!
//! A closed taxonomy: every fallible operation returns a typed error,
//! never a generic escape hatch, so that exit-code mapping survives
//! crossing a phase boundary intact.

use thiserror::Error;

/// Unified error enumeration for the deployment orchestrator and its
/// subsystems.
///
/// Each variant corresponds to one entry in the error taxonomy.
/// `exit_code` implements the mapping to process exit codes.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Malformed input: missing `sql`, an out-of-range plan count, a
    /// malshaped operation. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Coverage fell below the configured enforcement threshold.
    #[error("coverage enforcement failed: {gap_count} gap(s), {coverage_percentage}% covered")]
    CoverageEnforcement {
        gap_count: usize,
        coverage_percentage: u8,
    },

    /// The scanner or template generator could not parse or produce a
    /// valid artifact.
    #[error("parsing failed: {0}")]
    Parsing(String),

    /// The enforcement pipeline itself failed (scanner crash, I/O error)
    /// as opposed to coverage legitimately falling short. Governed by a
    /// bypass policy: allowed outside production with an explicit reason,
    /// fatal in production.
    #[error("coverage pipeline failed: {0}")]
    TechnicalCoverage(String),

    /// A `git` subprocess invocation failed. Carries the exit code and
    /// stderr captured by [`crate::child_process::ChildProcess`].
    #[error("git command failed (exit {exit_code:?}): {stderr}")]
    Git { exit_code: Option<i32>, stderr: String },

    /// Any other `ChildProcess` invocation failed (test runner, function
    /// deployer).
    #[error("subprocess `{command}` failed (exit {exit_code:?}): {stderr}")]
    Subprocess {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// An operation failed mid-migration-transaction; the transaction was
    /// rolled back.
    #[error("migration transaction failed on operation {operation_index}: {message}")]
    Transaction {
        operation_index: usize,
        message: String,
    },

    /// A rollback itself failed. Fatal: requires manual intervention.
    #[error("rollback failed and requires manual intervention: {0}")]
    Rollback(String),

    /// A subprocess invocation exceeded its configured timeout. A subcase
    /// of [`DeployError::Subprocess`]/[`DeployError::Git`], distinguished
    /// by `kind` so callers can match on it directly.
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    /// The deployment was cancelled via the cooperative cancellation
    /// token.
    #[error("deployment cancelled during phase `{phase}`")]
    Cancelled { phase: String },

    /// I/O error from the underlying filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Maps this error to the process exit code a CLI front-end should use.
    ///
    /// `0` is reserved for success/decline and is never returned here.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::Validation(_) => 2,
            DeployError::CoverageEnforcement { .. } => 3,
            DeployError::Parsing(_) => 4,
            // Everything else is a general deployment failure (exit 1):
            // technical coverage failures, git/subprocess/transaction/
            // rollback/timeout/cancellation all surface as phase failures
            // rather than the more specific input/coverage/parsing cases.
            DeployError::TechnicalCoverage(_)
            | DeployError::Git { .. }
            | DeployError::Subprocess { .. }
            | DeployError::Transaction { .. }
            | DeployError::Rollback(_)
            | DeployError::Timeout { .. }
            | DeployError::Cancelled { .. }
            | DeployError::Io(_) => 1,
        }
    }

    /// A short machine-distinguishable kind, used by callers that want to
    /// match on error category without matching the full variant (e.g. to
    /// special-case `Timeout` without caring whether it wrapped a git or a
    /// test-runner invocation).
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Validation(_) => "validation",
            DeployError::CoverageEnforcement { .. } => "coverage_enforcement",
            DeployError::Parsing(_) => "parsing",
            DeployError::TechnicalCoverage(_) => "technical_coverage",
            DeployError::Git { .. } => "git",
            DeployError::Subprocess { .. } => "subprocess",
            DeployError::Transaction { .. } => "transaction",
            DeployError::Rollback(_) => "rollback",
            DeployError::Timeout { .. } => "timeout",
            DeployError::Cancelled { .. } => "cancelled",
            DeployError::Io(_) => "io",
        }
    }

    /// A remediation hint to surface alongside the error ("pull first",
    /// "use --coverage-bypass-reason", ...). The CLI/reporter layer (out
    /// of scope here) decides how to render it.
    pub fn remediation_hint(&self) -> Option<&'static str> {
        match self {
            DeployError::CoverageEnforcement { .. } => {
                Some("run the test-template generator, or re-run with an explicit bypass reason")
            }
            DeployError::TechnicalCoverage(_) => {
                Some("supply --coverage-bypass-reason to proceed outside production")
            }
            DeployError::Git { stderr, .. } if stderr.contains("diverged") => {
                Some("pull and rebase before retrying")
            }
            _ => None,
        }
    }
}
