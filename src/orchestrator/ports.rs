//! External collaborators the orchestrator depends on but does not own
//! (spec.md §1, §6): the database execution surface, the upstream
//! operations analyzer, the interactive confirmation UI, and the
//! functions deployer. Each is an object-safe async trait so a caller can
//! supply a real Postgres/Supabase-backed implementation in production
//! and a test double everywhere else.

use std::path::Path;

use async_trait::async_trait;

use crate::errors::DeployError;
use crate::migration::operation::MigrationOperation;
use crate::orchestrator::MigrationRecord;

/// The single database surface this crate depends on (spec.md §6):
/// `exec_sql(sql text) RETURNS json`. We never own its implementation,
/// only verify its presence and drive a transaction through it.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// `hasExecSqlFunction` (spec.md §6): probes for the RPC rather than
    /// assuming it exists.
    async fn has_exec_sql_function(&self) -> Result<bool, DeployError>;
    async fn begin_transaction(&self) -> Result<(), DeployError>;
    async fn execute_in_transaction(&self, sql: &str) -> Result<(), DeployError>;
    async fn insert_migration_record(&self, record: &MigrationRecord) -> Result<(), DeployError>;
    async fn commit_transaction(&self) -> Result<(), DeployError>;
    async fn rollback_transaction(&self) -> Result<(), DeployError>;
}

/// Derives the `MigrationOperation` batch that transforms `previous_sql`
/// into `current_sql` (spec.md §1 Non-goal: "we do not parse SQL into an
/// AST at this layer"; operations arrive from this upstream collaborator
/// as opaque triples).
#[async_trait]
pub trait OperationsAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        current_sql: &str,
        previous_sql: &str,
    ) -> Result<Vec<MigrationOperation>, DeployError>;
}

/// The interactive confirmation surface (spec.md §1's "SafetyGates
/// interactive prompt UI" is explicitly out of scope here).
#[async_trait]
pub trait ConfirmationPrompt: Send + Sync {
    async fn confirm(&self, message: &str, destructive: bool) -> Result<bool, DeployError>;
}

/// Deploys whatever lives under `functions_dir` (spec.md §6). Out of
/// scope to implement here; the orchestrator only decides whether and
/// when to call it.
#[async_trait]
pub trait FunctionsDeployer: Send + Sync {
    async fn deploy(&self, functions_dir: &Path) -> Result<(), DeployError>;
}
