//! [`GitDeploymentTracker`]: the only component permitted to invoke `git`.
//! Every other component that needs Git state — the orchestrator, the
//! diff engine — goes through this tracker rather than shelling out
//! itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::child_process::{ChildProcess, ExecuteOptions};
use crate::config::GitTrackerConfig;
use crate::errors::DeployError;
use crate::events::{DeployEvent, EventSink, SharedSink};
use crate::git::status::{DeploymentReadiness, WorkingTreeStatus};
use crate::git::tag::DeploymentTag;

/// An opaque string naming a commit, branch, or tag.
pub type GitRef = String;

const COMPONENT: &str = "GitDeploymentTracker";

pub struct GitDeploymentTracker {
    config: GitTrackerConfig,
    process: ChildProcess,
    sink: SharedSink,
}

impl GitDeploymentTracker {
    pub fn new(config: GitTrackerConfig, sink: SharedSink) -> Self {
        Self {
            config,
            process: ChildProcess::new(),
            sink,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.git_timeout_secs)
    }

    fn options(&self) -> ExecuteOptions {
        ExecuteOptions::default()
            .with_cwd(&self.config.repo_root)
            .with_timeout(self.timeout())
    }

    async fn git<I, S>(&self, args: I) -> Result<String, DeployError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self
            .process
            .execute("git", args, self.options())
            .await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            tracing::warn!(exit_code = ?output.exit_code, stderr = %output.stderr, "git command failed");
            Err(DeployError::Git {
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// `git status --porcelain` reduced to a single boolean.
    pub async fn is_working_tree_clean(&self) -> Result<bool, DeployError> {
        Ok(self.get_working_tree_status().await?.is_clean())
    }

    pub async fn get_working_tree_status(&self) -> Result<WorkingTreeStatus, DeployError> {
        let output = self.git(["status", "--porcelain"]).await?;
        Ok(WorkingTreeStatus::parse_porcelain(&output))
    }

    /// Fails loudly on an empty repository (no commits yet); callers may
    /// treat that as "not a git repository" and skip git checks.
    pub async fn get_current_branch(&self) -> Result<String, DeployError> {
        let output = self.git(["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(output.trim().to_string())
    }

    pub async fn get_current_commit(&self) -> Result<String, DeployError> {
        let output = self.git(["rev-parse", "HEAD"]).await?;
        Ok(output.trim().to_string())
    }

    /// Errors accumulate rather than short-circuit, so `valid` only ever
    /// becomes false once every check has run.
    pub async fn validate_deployment_readiness(&self) -> Result<DeploymentReadiness, DeployError> {
        let branch = self.get_current_branch().await.unwrap_or_default();
        let status = self.get_working_tree_status().await.unwrap_or_default();
        let clean = status.is_clean();

        let mut readiness = DeploymentReadiness::new(branch.clone(), clean);

        if !clean {
            readiness.push_error("working tree is not clean");
            if !status.modified.is_empty() {
                readiness.push_warning(format!("{} modified file(s)", status.modified.len()));
            }
            if !status.staged.is_empty() {
                readiness.push_warning(format!("{} staged file(s)", status.staged.len()));
            }
            if !status.deleted.is_empty() {
                readiness.push_warning(format!("{} deleted file(s)", status.deleted.len()));
            }
            if !status.untracked.is_empty() {
                readiness.push_warning(format!("{} untracked file(s)", status.untracked.len()));
            }
        }

        if branch != "main" && branch != "master" {
            readiness.push_error(format!(
                "current branch `{branch}` is neither `main` nor `master`"
            ));
            return Ok(readiness);
        }

        match self.git(["fetch", "origin", &branch]).await {
            Ok(_) => {
                let ahead_behind = self.git([
                    "rev-list",
                    "--left-right",
                    "--count",
                    &format!("{branch}...origin/{branch}"),
                ]).await?;
                let mut parts = ahead_behind.split_whitespace();
                let ahead: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let behind: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

                if ahead > 0 && behind > 0 {
                    readiness.push_error(format!(
                        "branch has diverged from origin/{branch}: {ahead} ahead, {behind} behind"
                    ));
                } else if behind > 0 {
                    readiness.push_error(format!(
                        "branch is {behind} commit(s) behind origin/{branch}; pull first"
                    ));
                } else if ahead > 0 {
                    readiness.push_error(format!(
                        "branch is {ahead} commit(s) ahead of origin/{branch}; push first"
                    ));
                }
            }
            Err(DeployError::Git { stderr, .. }) if stderr.contains("does not appear to be a git repository")
                || stderr.contains("No such remote") =>
            {
                readiness.push_warning("no remote configured; skipping ahead/behind check");
            }
            Err(err) => return Err(err),
        }

        self.sink.emit(DeployEvent::Progress {
            component: COMPONENT.to_string(),
            message: format!("readiness: valid={} errors={}", readiness.valid, readiness.errors.len()),
        });

        Ok(readiness)
    }

    fn full_tag_name(&self, name: &str) -> String {
        if name.starts_with(&self.config.tag_prefix) {
            name.to_string()
        } else {
            format!("{}{}", self.config.tag_prefix, name)
        }
    }

    /// Creates an annotated tag whose message body is `metadata`
    /// serialized as JSON. Returns the full tag name actually created.
    pub async fn create_deployment_tag(
        &self,
        name: &str,
        metadata: &Value,
    ) -> Result<String, DeployError> {
        let full_name = self.full_tag_name(name);
        let message = serde_json::to_string(metadata)
            .map_err(|e| DeployError::Validation(format!("metadata is not valid JSON: {e}")))?;
        self.git(["tag", "-a", &full_name, "-m", &message]).await?;
        tracing::info!(tag = %full_name, "created deployment tag");
        self.sink.emit(DeployEvent::Success {
            component: COMPONENT.to_string(),
            message: format!("created deployment tag {full_name}"),
        });
        Ok(full_name)
    }

    pub async fn delete_deployment_tag(&self, name: &str) -> Result<(), DeployError> {
        let full_name = self.full_tag_name(name);
        self.git(["tag", "-d", &full_name]).await?;
        Ok(())
    }

    pub async fn tag_exists(&self, name: &str) -> Result<bool, DeployError> {
        let full_name = self.full_tag_name(name);
        let output = self
            .process
            .execute(
                "git",
                ["tag", "-l", &full_name],
                self.options(),
            )
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    /// Lists annotated tags matching the configured prefix, sorted by
    /// version-refname descending (git's own `--sort=-v:refname`), and
    /// returns the first. `None` if there are no deployment tags yet.
    pub async fn get_last_deployment_tag(&self) -> Result<Option<DeploymentTag>, DeployError> {
        let tags = self.get_deployment_history(1).await?;
        Ok(tags.into_iter().next())
    }

    /// The most recent `limit` deployment tags, newest first.
    pub async fn get_deployment_history(&self, limit: usize) -> Result<Vec<DeploymentTag>, DeployError> {
        self.list_deployment_tags(limit, 0).await
    }

    /// Pages lazily through the full tag history rather than requiring the
    /// caller to guess a limit up front, mirroring the scanner's
    /// batch-yielding idiom: each page is fetched from git independently,
    /// so the caller can stop early without ever materializing tags it
    /// doesn't need.
    pub fn deployment_history_all(&self) -> DeploymentHistoryPages<'_> {
        DeploymentHistoryPages {
            tracker: self,
            page_size: 50,
            skip: 0,
            exhausted: false,
        }
    }

    async fn list_deployment_tags(
        &self,
        count: usize,
        skip: usize,
    ) -> Result<Vec<DeploymentTag>, DeployError> {
        let pattern = format!("refs/tags/{}*", self.config.tag_prefix);
        let format = "%(refname:short)%00%(objectname)%00%(creatordate:iso-strict)%00%(contents)%01";
        let mut args: Vec<String> = vec![
            "for-each-ref".to_string(),
            "--sort=-v:refname".to_string(),
            format!("--format={format}"),
        ];
        if count > 0 {
            args.push(format!("--count={}", count + skip));
        }
        args.push(pattern);

        let output = self.git(args).await?;
        let records: Vec<&str> = output
            .split('\u{1}')
            .filter(|record| !record.trim().is_empty())
            .skip(skip)
            .collect();

        let mut tags = Vec::new();
        for record in records {
            let mut fields = record.trim().splitn(4, '\u{0}');
            let (Some(name), Some(commit_hash), Some(timestamp_raw), Some(contents)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let timestamp = chrono::DateTime::parse_from_rfc3339(timestamp_raw.trim())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now());
            let metadata = serde_json::from_str(contents.trim()).unwrap_or(Value::Null);
            tags.push(DeploymentTag {
                name: name.to_string(),
                commit_hash: commit_hash.to_string(),
                timestamp,
                metadata,
            });
            if count > 0 && tags.len() >= count {
                break;
            }
        }
        Ok(tags)
    }

    /// Concatenates every `*.sql` under the configured SQL directory as
    /// it existed at `commit_hash`, in lexicographic path order, each
    /// preceded by a `-- File: <path>` banner. A file absent at that
    /// commit is skipped with a progress event, never an error.
    pub async fn get_sql_at_commit(&self, commit_hash: &str) -> Result<String, DeployError> {
        let sql_dir = self.config.sql_dir.to_string_lossy().to_string();
        let listing = self
            .git(["ls-tree", "-r", "--name-only", commit_hash, "--", &sql_dir])
            .await?;

        let mut paths: Vec<&str> = listing
            .lines()
            .filter(|line| line.ends_with(".sql"))
            .collect();
        paths.sort_unstable();

        let mut buffer = String::new();
        for path in paths {
            match self.show_blob(&commit_hash.to_string(), path).await? {
                Some(content) => {
                    buffer.push_str(&format!("-- File: {path}\n"));
                    buffer.push_str(&content);
                    if !content.ends_with('\n') {
                        buffer.push('\n');
                    }
                    buffer.push('\n');
                }
                None => {
                    self.sink.emit(DeployEvent::Progress {
                        component: COMPONENT.to_string(),
                        message: format!("{path} does not exist at {commit_hash}, skipping"),
                    });
                }
            }
        }
        Ok(buffer)
    }

    /// The content of `path` as it existed at `commit_ref`, or `None` if
    /// the path did not exist there. Never returns an error for a missing
    /// path — only for a genuine `git` failure (bad ref, I/O).
    pub async fn show_blob(&self, commit_ref: &GitRef, path: &str) -> Result<Option<String>, DeployError> {
        let spec = format!("{commit_ref}:{path}");
        match self.git(["show", &spec]).await {
            Ok(content) => Ok(Some(content)),
            Err(DeployError::Git { stderr, .. })
                if stderr.contains("does not exist") || stderr.contains("exists on disk, but not in") =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The list of files changed between `from` and `to` under the SQL
    /// directory, as `(path, status_char)` pairs from
    /// `git diff --name-status`. [`crate::migration::diff_engine::DiffEngine`]
    /// builds on top of this rather than invoking `git` itself, since
    /// this tracker is the only component allowed to do so.
    pub async fn get_changes_between_commits(
        &self,
        from: &GitRef,
        to: &GitRef,
    ) -> Result<Vec<(String, char)>, DeployError> {
        let sql_dir = format!("{}/", self.config.sql_dir.to_string_lossy());
        let range = format!("{from}...{to}");
        let output = self
            .git(["diff", "--name-status", &range, "--", &sql_dir])
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, '\t');
                let status = parts.next()?.chars().next()?;
                let path = parts.next()?.to_string();
                Some((path, status))
            })
            .collect())
    }

    /// The raw unified diff text for the SQL directory between two refs.
    /// Consumed by [`crate::migration::diff_engine::DiffEngine`].
    pub async fn diff_sql_tree(&self, from: &GitRef, to: &GitRef) -> Result<String, DeployError> {
        let sql_dir = format!("{}/", self.config.sql_dir.to_string_lossy());
        let range = format!("{from}...{to}");
        self.git(["diff", &range, "--", &sql_dir]).await
    }

    pub async fn push_deployment_tags(&self, remote: &str) -> Result<(), DeployError> {
        let pattern = format!("{}*", self.config.tag_prefix);
        self.git(["push", remote, &pattern]).await?;
        Ok(())
    }

    pub fn repo_root(&self) -> &Path {
        &self.config.repo_root
    }

    pub fn sql_dir(&self) -> PathBuf {
        self.config.repo_root.join(&self.config.sql_dir)
    }
}

/// Lazy pagination over deployment tag history.
pub struct DeploymentHistoryPages<'a> {
    tracker: &'a GitDeploymentTracker,
    page_size: usize,
    skip: usize,
    exhausted: bool,
}

impl<'a> DeploymentHistoryPages<'a> {
    /// Fetches and returns the next page, or `None` once the history is
    /// exhausted. Not a `std::iter::Iterator` because fetching a page is
    /// async; callers drive it with a `while let Some(page) = pages.next_page().await`.
    pub async fn next_page(&mut self) -> Result<Option<Vec<DeploymentTag>>, DeployError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .tracker
            .list_deployment_tags(self.page_size, self.skip)
            .await?;
        self.skip += page.len();
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use std::sync::Arc;
    use tokio::process::Command;

    async fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let dir = dir.path().to_path_buf();
            let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            async move {
                Command::new("git")
                    .args(&args)
                    .current_dir(&dir)
                    .output()
                    .await
                    .unwrap()
            }
        };
        run(&["init", "-q", "-b", "main"]).await;
        run(&["config", "user.email", "test@example.com"]).await;
        run(&["config", "user.name", "test"]).await;
        std::fs::create_dir_all(dir.path().join("sql/001_tables")).unwrap();
        std::fs::write(
            dir.path().join("sql/001_tables/users.sql"),
            "CREATE TABLE users (id int primary key);\n",
        )
        .unwrap();
        run(&["add", "."]).await;
        run(&["commit", "-q", "-m", "init"]).await;
        dir
    }

    fn tracker_for(dir: &tempfile::TempDir) -> GitDeploymentTracker {
        let config = GitTrackerConfig {
            repo_root: dir.path().to_path_buf(),
            sql_dir: PathBuf::from("sql"),
            ..GitTrackerConfig::default()
        };
        GitDeploymentTracker::new(config, Arc::new(NullSink))
    }

    #[tokio::test]
    async fn clean_repo_reports_clean() {
        let dir = init_repo().await;
        let tracker = tracker_for(&dir);
        assert!(tracker.is_working_tree_clean().await.unwrap());
    }

    #[tokio::test]
    async fn dirty_file_is_detected() {
        let dir = init_repo().await;
        std::fs::write(dir.path().join("sql/001_tables/users.sql"), "-- changed\n").unwrap();
        let tracker = tracker_for(&dir);
        let status = tracker.get_working_tree_status().await.unwrap();
        assert!(!status.is_clean());
        assert_eq!(status.modified, vec!["sql/001_tables/users.sql"]);
    }

    #[tokio::test]
    async fn create_and_read_back_tag_metadata() {
        let dir = init_repo().await;
        let tracker = tracker_for(&dir);
        let metadata = serde_json::json!({
            "migrationId": "migration_abc",
            "operations": 2,
            "environment": "production",
        });
        let full_name = tracker
            .create_deployment_tag("20260727-migration_abc", &metadata)
            .await
            .unwrap();
        assert!(full_name.starts_with("data-deploy-"));
        assert!(tracker.tag_exists("20260727-migration_abc").await.unwrap());

        let last = tracker.get_last_deployment_tag().await.unwrap().unwrap();
        assert_eq!(last.name, full_name);
        assert_eq!(last.metadata, metadata);
    }

    #[tokio::test]
    async fn sql_at_commit_skips_missing_files() {
        let dir = init_repo().await;
        let tracker = tracker_for(&dir);
        let commit = tracker.get_current_commit().await.unwrap();
        let sql = tracker.get_sql_at_commit(&commit).await.unwrap();
        assert!(sql.contains("-- File: sql/001_tables/users.sql"));
        assert!(sql.contains("CREATE TABLE users"));
    }

    #[tokio::test]
    async fn sql_at_commit_is_monotonic_across_unrelated_commits() {
        // If the SQL tree is unchanged between two commits,
        // getSQLAtCommit must agree.
        let dir = init_repo().await;
        let tracker = tracker_for(&dir);
        let first = tracker.get_current_commit().await.unwrap();
        let first_sql = tracker.get_sql_at_commit(&first).await.unwrap();

        std::fs::write(dir.path().join("README.md"), "unrelated change\n").unwrap();
        let run = |args: &[&str]| {
            let dir = dir.path().to_path_buf();
            let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            async move {
                Command::new("git")
                    .args(&args)
                    .current_dir(&dir)
                    .output()
                    .await
                    .unwrap()
            }
        };
        run(&["add", "."]).await;
        run(&["commit", "-q", "-m", "unrelated"]).await;
        let second = tracker.get_current_commit().await.unwrap();
        let second_sql = tracker.get_sql_at_commit(&second).await.unwrap();

        assert_eq!(first_sql, second_sql);
    }
}
