//! The top-level state machine that sequences every other module into one
//! deployment (spec.md §4.10):
//! `validation -> testing? -> analysis -> coverage? -> preview ->
//! confirmation? -> migration -> functions? -> tagging -> complete`, with
//! `rollback` as the alternate entry point and terminal state.
//!
//! [`Orchestrator`] owns no `git`/SQL access itself; it drives
//! [`crate::git::GitDeploymentTracker`] and [`crate::coverage::TestCoverageOrchestrator`]
//! and reaches the collaborators spec.md §1/§6 place out of scope through
//! the [`ports`] traits.

pub mod cancellation;
pub mod ports;

pub use cancellation::CancellationToken;
pub use ports::{ConfirmationPrompt, FunctionsDeployer, OperationsAnalyzer, SqlExecutor};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::OrchestratorConfig;
use crate::coverage::{CheckCoverageOptions, TestCoverageOrchestrator};
use crate::errors::DeployError;
use crate::events::{DeployEvent, EventSink, SharedSink};
use crate::git::tag::DeploymentMetadata;
use crate::git::GitDeploymentTracker;
use crate::migration::operation::{validate_operations, MigrationOperation};

const COMPONENT: &str = "Orchestrator";

/// Record inserted into the target database alongside a committed
/// migration (SPEC_FULL.md §3), mirroring [`DeploymentMetadata`]'s fields
/// so the two stay trivially convertible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub applied_at: DateTime<Utc>,
    pub operation_count: usize,
    pub environment: String,
    pub git_commit: String,
}

impl MigrationRecord {
    fn to_metadata(&self) -> DeploymentMetadata {
        DeploymentMetadata {
            migration_id: self.migration_id.clone(),
            operations: self.operation_count,
            timestamp: self.applied_at,
            environment: self.environment.clone(),
        }
    }
}

/// A preview of what `rollback` would execute, built before any
/// confirmation prompt or SQL runs (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPlan {
    pub from_tag: String,
    pub to_commit: String,
    pub operations: Vec<MigrationOperation>,
}

impl RollbackPlan {
    fn destructive_count(&self) -> usize {
        self.operations.iter().filter(|op| op.is_destructive()).count()
    }
}

/// Options for [`Orchestrator::rollback`].
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Skip the confirmation prompt; set when rollback is invoked by the
    /// orchestrator's own auto-recovery path (spec.md §4.10 Auto-recovery).
    pub automatic: bool,
}

/// What a `deploy` or `rollback` call settled on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployOutcome {
    pub deployed: bool,
    pub migration_id: Option<String>,
    pub tag: Option<String>,
    pub operation_count: usize,
    pub message: String,
}

impl DeployOutcome {
    fn declined(message: impl Into<String>) -> Self {
        Self {
            deployed: false,
            migration_id: None,
            tag: None,
            operation_count: 0,
            message: message.into(),
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    tracker: GitDeploymentTracker,
    coverage: TestCoverageOrchestrator,
    sql_executor: Arc<dyn SqlExecutor>,
    operations_analyzer: Arc<dyn OperationsAnalyzer>,
    confirmation: Arc<dyn ConfirmationPrompt>,
    functions_deployer: Arc<dyn FunctionsDeployer>,
    sink: SharedSink,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        tracker: GitDeploymentTracker,
        coverage: TestCoverageOrchestrator,
        sql_executor: Arc<dyn SqlExecutor>,
        operations_analyzer: Arc<dyn OperationsAnalyzer>,
        confirmation: Arc<dyn ConfirmationPrompt>,
        functions_deployer: Arc<dyn FunctionsDeployer>,
        sink: SharedSink,
    ) -> Self {
        Self {
            config,
            tracker,
            coverage,
            sql_executor,
            operations_analyzer,
            confirmation,
            functions_deployer,
            sink,
        }
    }

    fn check_cancelled(&self, phase: &str, cancellation: &CancellationToken) -> Result<(), DeployError> {
        if cancellation.is_cancelled() {
            self.sink.emit(DeployEvent::Cancelled {
                phase: phase.to_string(),
            });
            return Err(DeployError::Cancelled {
                phase: phase.to_string(),
            });
        }
        Ok(())
    }

    /// Concatenates every `*.sql` under the configured tree as it exists
    /// on disk right now, formatted identically to
    /// [`GitDeploymentTracker::get_sql_at_commit`] so the two are directly
    /// comparable by [`OperationsAnalyzer::analyze`].
    fn load_current_sql(&self) -> Result<String, DeployError> {
        let root = self.tracker.sql_dir();
        let mut paths: Vec<_> = WalkDir::new(&root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "sql"))
            .map(|entry| entry.path().to_path_buf())
            .collect();
        paths.sort();

        let mut buffer = String::new();
        for path in paths {
            let relative = path.strip_prefix(&root).unwrap_or(&path);
            let content = std::fs::read_to_string(&path)?;
            buffer.push_str(&format!("-- File: {}\n", relative.display()));
            buffer.push_str(&content);
            if !content.ends_with('\n') {
                buffer.push('\n');
            }
            buffer.push('\n');
        }
        Ok(buffer)
    }

    /// Runs the deployment phases in order, stopping at the first
    /// declined confirmation, empty operation batch, or error. Never
    /// leaves an open database transaction on any exit path (spec.md §5).
    pub async fn deploy(&self, cancellation: &CancellationToken) -> Result<DeployOutcome, DeployError> {
        tracing::info!(environment = %self.config.environment, "starting deployment");
        self.sink.emit(DeployEvent::Start {
            component: COMPONENT.to_string(),
            message: "starting deployment".to_string(),
        });

        // validation
        self.check_cancelled("validation", cancellation)?;
        let readiness = self.tracker.validate_deployment_readiness().await?;
        if !readiness.valid {
            return Err(DeployError::Validation(readiness.errors.join("; ")));
        }

        // testing
        if !self.config.skip_tests {
            self.check_cancelled("testing", cancellation)?;
            self.run_external_tests().await?;
        }

        // analysis
        self.check_cancelled("analysis", cancellation)?;
        let current_sql = self.load_current_sql()?;
        let previous_sql = match self.tracker.get_last_deployment_tag().await? {
            Some(tag) => self.tracker.get_sql_at_commit(&tag.commit_hash).await?,
            None => String::new(),
        };
        let operations = self.operations_analyzer.analyze(&current_sql, &previous_sql).await?;
        tracing::info!(operation_count = operations.len(), "analysis complete");
        if operations.is_empty() {
            self.sink.emit(DeployEvent::Complete {
                deployed: false,
                message: "no schema changes detected".to_string(),
            });
            return Ok(DeployOutcome::declined("no schema changes detected"));
        }
        validate_operations(&operations)?;

        // coverage
        if !self.config.skip_coverage {
            self.check_cancelled("coverage", cancellation)?;
            let result = self
                .coverage
                .check_coverage(&operations, &CheckCoverageOptions::default())?;
            if result.should_block {
                return Err(DeployError::CoverageEnforcement {
                    gap_count: result.gaps.len(),
                    coverage_percentage: result.coverage_percentage,
                });
            }
        }

        // preview
        self.check_cancelled("preview", cancellation)?;
        self.emit_preview(&operations);

        // confirmation
        if !self.config.dry_run {
            self.check_cancelled("confirmation", cancellation)?;
            if !self.confirm_if_needed(&operations).await? {
                return Ok(DeployOutcome::declined("deployment declined at confirmation"));
            }
        } else {
            self.sink.emit(DeployEvent::Complete {
                deployed: false,
                message: "dry run: stopping before migration".to_string(),
            });
            return Ok(DeployOutcome::declined("dry run"));
        }

        // migration
        self.check_cancelled("migration", cancellation)?;
        let commit = self.tracker.get_current_commit().await?;
        let migration_id = format!("migration_{}", uuid::Uuid::now_v7().simple());
        let record = MigrationRecord {
            migration_id: migration_id.clone(),
            applied_at: Utc::now(),
            operation_count: operations.len(),
            environment: self.config.environment.clone(),
            git_commit: commit,
        };
        self.run_migration(&operations, &record, cancellation).await?;

        // functions, tagging, complete with auto-recovery
        match self.run_post_migration(&record, cancellation).await {
            Ok(tag) => {
                self.sink.emit(DeployEvent::Complete {
                    deployed: true,
                    message: format!("deployed {} operation(s) as {}", operations.len(), tag),
                });
                Ok(DeployOutcome {
                    deployed: true,
                    migration_id: Some(record.migration_id),
                    tag: Some(tag),
                    operation_count: operations.len(),
                    message: "deployment complete".to_string(),
                })
            }
            Err(err) => {
                tracing::error!(%err, "post-migration phase failed, attempting auto-recovery");
                self.sink.emit(DeployEvent::Error {
                    component: COMPONENT.to_string(),
                    message: format!("post-migration phase failed, attempting auto-recovery: {err}"),
                });
                self.auto_recover(cancellation).await?;
                Err(err)
            }
        }
    }

    async fn run_external_tests(&self) -> Result<(), DeployError> {
        let Some(command) = &self.config.test_command else {
            return Ok(());
        };
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };
        self.sink.emit(DeployEvent::Start {
            component: COMPONENT.to_string(),
            message: format!("running {program}"),
        });
        let process = crate::child_process::ChildProcess::new();
        let options = crate::child_process::ExecuteOptions::default()
            .with_timeout(std::time::Duration::from_secs(self.config.test_timeout_secs));
        process.execute_checked(program, args, options).await?;
        self.sink.emit(DeployEvent::Success {
            component: COMPONENT.to_string(),
            message: "tests passed".to_string(),
        });
        Ok(())
    }

    fn emit_preview(&self, operations: &[MigrationOperation]) {
        let destructive_count = operations.iter().filter(|op| op.is_destructive()).count();
        self.sink.emit(DeployEvent::Preview {
            operation_count: operations.len(),
            destructive_count,
            estimated_duration_secs: estimate_duration(operations),
        });
    }

    async fn confirm_if_needed(&self, operations: &[MigrationOperation]) -> Result<bool, DeployError> {
        let destructive: Vec<&MigrationOperation> = operations.iter().filter(|op| op.is_destructive()).collect();
        if destructive.is_empty() {
            return Ok(true);
        }
        let message = destructive
            .iter()
            .map(|op| op.description.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        self.sink.emit(DeployEvent::Prompt {
            message: message.clone(),
            destructive: true,
        });
        if !self.confirmation.confirm(&message, true).await? {
            return Ok(false);
        }
        if self.config.environment == "production" {
            if !self
                .confirmation
                .confirm("confirm deployment to production", true)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_migration(
        &self,
        operations: &[MigrationOperation],
        record: &MigrationRecord,
        cancellation: &CancellationToken,
    ) -> Result<(), DeployError> {
        if !self.sql_executor.has_exec_sql_function().await? {
            return Err(DeployError::Validation(
                "target database does not expose the exec_sql RPC".to_string(),
            ));
        }

        self.sql_executor.begin_transaction().await?;

        for (index, operation) in operations.iter().enumerate() {
            if cancellation.is_cancelled() {
                self.sql_executor.rollback_transaction().await?;
                self.sink.emit(DeployEvent::Cancelled {
                    phase: "migration".to_string(),
                });
                return Err(DeployError::Cancelled {
                    phase: "migration".to_string(),
                });
            }
            self.sink.emit(DeployEvent::OperationExecuting {
                operation: operation.clone(),
                index,
                total: operations.len(),
            });
            if let Err(err) = self.sql_executor.execute_in_transaction(&operation.sql).await {
                self.sql_executor.rollback_transaction().await?;
                return Err(DeployError::Transaction {
                    operation_index: index,
                    message: err.to_string(),
                });
            }
        }

        self.sql_executor.insert_migration_record(record).await?;
        self.sql_executor.commit_transaction().await?;
        self.sink.emit(DeployEvent::PartialCommitWindow {
            migration_id: record.migration_id.clone(),
        });
        Ok(())
    }

    /// Runs `functions` (if configured) then `tagging`. A functions
    /// failure is reported but does not propagate: spec.md §4.10's
    /// functions-phase description is explicit that it "does not
    /// automatically trigger rollback", which takes precedence over the
    /// general Auto-recovery paragraph for this one phase. Only a tagging
    /// failure reaches the caller's auto-recovery path.
    async fn run_post_migration(
        &self,
        record: &MigrationRecord,
        cancellation: &CancellationToken,
    ) -> Result<String, DeployError> {
        if !self.config.skip_functions {
            if let Some(functions_dir) = self.config.functions_dir.clone() {
                if cancellation.is_cancelled() {
                    self.sink.emit(DeployEvent::Cancelled {
                        phase: "functions".to_string(),
                    });
                } else {
                    let deploy = self.functions_deployer.deploy(&functions_dir);
                    let timeout = std::time::Duration::from_secs(self.config.function_deploy_timeout_secs);
                    let outcome = match tokio::time::timeout(timeout, deploy).await {
                        Ok(result) => result,
                        Err(_) => Err(DeployError::Timeout {
                            command: "functions deploy".to_string(),
                            timeout_secs: self.config.function_deploy_timeout_secs,
                        }),
                    };
                    if let Err(err) = outcome {
                        self.sink.emit(DeployEvent::Error {
                            component: COMPONENT.to_string(),
                            message: format!(
                                "functions deploy failed, migration already committed: {err}"
                            ),
                        });
                    }
                }
            }
        }

        if cancellation.is_cancelled() {
            self.sink.emit(DeployEvent::Cancelled {
                phase: "tagging".to_string(),
            });
            return Err(DeployError::Cancelled {
                phase: "tagging".to_string(),
            });
        }

        let tag_name = format!("{}-{}", record.applied_at.format("%Y%m%d%H%M%S"), record.migration_id);
        self.tracker
            .create_deployment_tag(&tag_name, &record.to_metadata().to_value())
            .await
    }

    async fn auto_recover(&self, cancellation: &CancellationToken) -> Result<(), DeployError> {
        match self
            .rollback(RollbackOptions { automatic: true }, cancellation)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => Err(DeployError::Rollback(format!(
                "auto-recovery rollback failed: {err}"
            ))),
        }
    }

    /// Builds the reverse operation batch without executing anything,
    /// for previewing a rollback before committing to it (SPEC_FULL.md
    /// §3).
    pub async fn plan_rollback(&self) -> Result<RollbackPlan, DeployError> {
        let last_tag = self
            .tracker
            .get_last_deployment_tag()
            .await?
            .ok_or_else(|| DeployError::Rollback("no deployment tag to roll back to".to_string()))?;

        let target_sql = self.tracker.get_sql_at_commit(&last_tag.commit_hash).await?;
        let current_sql = self.load_current_sql()?;
        let operations = self.operations_analyzer.analyze(&target_sql, &current_sql).await?;

        Ok(RollbackPlan {
            from_tag: last_tag.name,
            to_commit: last_tag.commit_hash,
            operations,
        })
    }

    /// Reverts the working tree's deployed state back to the last
    /// deployment tag (spec.md §4.10 `rollback`). "Last deployment tag" is
    /// read literally: in the auto-recovery path the current deploy's own
    /// tag has not been created yet, so this resolves to the previous
    /// successful deployment; invoked standalone, it restores to the last
    /// known-good deployed state.
    pub async fn rollback(
        &self,
        options: RollbackOptions,
        cancellation: &CancellationToken,
    ) -> Result<DeployOutcome, DeployError> {
        self.sink.emit(DeployEvent::Start {
            component: COMPONENT.to_string(),
            message: "starting rollback".to_string(),
        });

        let plan = self.plan_rollback().await?;
        if plan.operations.is_empty() {
            return Ok(DeployOutcome::declined("already at the last deployed state"));
        }

        self.sink.emit(DeployEvent::Preview {
            operation_count: plan.operations.len(),
            destructive_count: plan.destructive_count(),
            estimated_duration_secs: estimate_duration(&plan.operations),
        });

        if !options.automatic {
            self.check_cancelled("confirmation", cancellation)?;
            let message = format!(
                "roll back to {} ({} operation(s))",
                plan.from_tag,
                plan.operations.len()
            );
            self.sink.emit(DeployEvent::Prompt {
                message: message.clone(),
                destructive: true,
            });
            if !self.confirmation.confirm(&message, true).await? {
                return Ok(DeployOutcome::declined("rollback declined at confirmation"));
            }
        }

        self.check_cancelled("migration", cancellation)?;
        let migration_id = format!("rollback_{}", uuid::Uuid::now_v7().simple());
        let record = MigrationRecord {
            migration_id: migration_id.clone(),
            applied_at: Utc::now(),
            operation_count: plan.operations.len(),
            environment: self.config.environment.clone(),
            git_commit: plan.to_commit.clone(),
        };
        self.run_migration(&plan.operations, &record, cancellation).await?;

        let tag_name = format!(
            "rollback-{}-from-{}",
            record.applied_at.format("%Y%m%d%H%M%S"),
            plan.from_tag
        );
        let tag = self
            .tracker
            .create_deployment_tag(&tag_name, &record.to_metadata().to_value())
            .await?;

        self.sink.emit(DeployEvent::Complete {
            deployed: true,
            message: format!("rolled back to {} as {}", plan.from_tag, tag),
        });

        Ok(DeployOutcome {
            deployed: true,
            migration_id: Some(record.migration_id),
            tag: Some(tag),
            operation_count: plan.operations.len(),
            message: "rollback complete".to_string(),
        })
    }
}

/// A coarse duration estimate for the preview event: a fixed per-operation
/// cost, doubled for destructive operations since they tend to involve
/// table rewrites (spec.md §4.10 preview phase).
fn estimate_duration(operations: &[MigrationOperation]) -> u64 {
    const BASE_SECS: u64 = 2;
    operations
        .iter()
        .map(|op| if op.is_destructive() { BASE_SECS * 3 } else { BASE_SECS })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnforcementConfig, EnforcementLevel, GitTrackerConfig, ScannerConfig};
    use crate::coverage::PgTapTestScanner;
    use crate::events::NullSink;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    struct FixedAnalyzer {
        operations: Vec<MigrationOperation>,
    }

    #[async_trait::async_trait]
    impl OperationsAnalyzer for FixedAnalyzer {
        async fn analyze(&self, _current: &str, _previous: &str) -> Result<Vec<MigrationOperation>, DeployError> {
            Ok(self.operations.clone())
        }
    }

    struct AlwaysConfirm;

    #[async_trait::async_trait]
    impl ConfirmationPrompt for AlwaysConfirm {
        async fn confirm(&self, _message: &str, _destructive: bool) -> Result<bool, DeployError> {
            Ok(true)
        }
    }

    struct NoopFunctions;

    #[async_trait::async_trait]
    impl FunctionsDeployer for NoopFunctions {
        async fn deploy(&self, _functions_dir: &Path) -> Result<(), DeployError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
        committed: Mutex<bool>,
    }

    #[async_trait::async_trait]
    impl SqlExecutor for RecordingExecutor {
        async fn has_exec_sql_function(&self) -> Result<bool, DeployError> {
            Ok(true)
        }
        async fn begin_transaction(&self) -> Result<(), DeployError> {
            Ok(())
        }
        async fn execute_in_transaction(&self, sql: &str) -> Result<(), DeployError> {
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(())
        }
        async fn insert_migration_record(&self, _record: &MigrationRecord) -> Result<(), DeployError> {
            Ok(())
        }
        async fn commit_transaction(&self) -> Result<(), DeployError> {
            *self.committed.lock().unwrap() = true;
            Ok(())
        }
        async fn rollback_transaction(&self) -> Result<(), DeployError> {
            Ok(())
        }
    }

    fn init_repo(dir: &Path) {
        std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "test"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::fs::create_dir_all(dir.join("sql")).unwrap();
        std::fs::write(dir.join("sql/users.sql"), "CREATE TABLE users(id int);\n").unwrap();
        std::fs::create_dir_all(dir.join("tests")).unwrap();
        std::fs::write(
            dir.join("tests/users_test.sql"),
            "SELECT plan(1);\nSELECT has_table('public','users');\n",
        )
        .unwrap();
        std::process::Command::new("git")
            .args(["checkout", "-q", "-B", "main"])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["add", "."])
            .current_dir(dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "initial"])
            .current_dir(dir)
            .status()
            .unwrap();
    }

    fn orchestrator(dir: &Path, operations: Vec<MigrationOperation>, executor: Arc<dyn SqlExecutor>) -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.git = GitTrackerConfig {
            repo_root: dir.to_path_buf(),
            sql_dir: PathBuf::from("sql"),
            ..Default::default()
        };
        config.scanner = ScannerConfig {
            tests_dir: dir.join("tests"),
            ..Default::default()
        };
        config.enforcement = EnforcementConfig {
            level: EnforcementLevel::Strict,
            allow_bypass: false,
            generate_templates: true,
            is_production: false,
        };
        config.environment = "staging".to_string();
        config.skip_tests = true;

        let sink: SharedSink = Arc::new(NullSink);
        let tracker = GitDeploymentTracker::new(config.git.clone(), sink.clone());
        let scanner = PgTapTestScanner::new(config.scanner.clone(), sink.clone());
        let coverage = TestCoverageOrchestrator::new(scanner, config.enforcement.clone(), sink.clone());

        Orchestrator::new(
            config,
            tracker,
            coverage,
            executor,
            Arc::new(FixedAnalyzer { operations }),
            Arc::new(AlwaysConfirm),
            Arc::new(NoopFunctions),
            sink,
        )
    }

    #[tokio::test]
    async fn s1_happy_path_deploys_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let executor = Arc::new(RecordingExecutor::default());
        let deployer = orchestrator(
            dir.path(),
            vec![MigrationOperation::safe("CREATE TABLE users(id int);", "create users")],
            executor.clone(),
        );

        let outcome = deployer.deploy(&CancellationToken::new()).await.unwrap();
        assert!(outcome.deployed);
        assert!(outcome.tag.is_some());
        assert_eq!(outcome.operation_count, 1);
        assert!(*executor.committed.lock().unwrap());
    }

    #[tokio::test]
    async fn no_operations_short_circuits_without_deploying() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let executor = Arc::new(RecordingExecutor::default());
        let deployer = orchestrator(dir.path(), vec![], executor);

        let outcome = deployer.deploy(&CancellationToken::new()).await.unwrap();
        assert!(!outcome.deployed);
    }

    #[tokio::test]
    async fn coverage_gap_blocks_deployment_with_exit_3_kind() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        // Overwrite the test file so it no longer covers the new table.
        std::fs::write(dir.path().join("tests/users_test.sql"), "SELECT plan(0);\n").unwrap();

        let executor = Arc::new(RecordingExecutor::default());
        let deployer = orchestrator(
            dir.path(),
            vec![MigrationOperation::safe(
                "CREATE TABLE accounts(id int);",
                "create accounts",
            )],
            executor,
        );

        let err = deployer.deploy(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "coverage_enforcement");
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_migration_leaves_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let executor = Arc::new(RecordingExecutor::default());
        let deployer = orchestrator(
            dir.path(),
            vec![MigrationOperation::safe("CREATE TABLE users(id int);", "create users")],
            executor.clone(),
        );

        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let err = deployer.deploy(&cancellation).await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert!(!*executor.committed.lock().unwrap());
    }

    #[tokio::test]
    async fn rollback_with_no_prior_tag_is_a_rollback_error() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let executor = Arc::new(RecordingExecutor::default());
        let deployer = orchestrator(dir.path(), vec![], executor);

        let err = deployer
            .rollback(RollbackOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rollback");
    }
}
