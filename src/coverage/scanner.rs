//! [`PgTapTestScanner`]: discovers pgTAP test files and parses the
//! assertions inside them (spec.md §4.5).
//!
//! Call arguments are recovered with a small hand-written parser — find
//! the literal `kind(`, walk forward tracking quote and paren depth, then
//! split on top-level commas — instead of one regex per assertion kind,
//! per spec.md §9's note that a regex catalog invites ambiguity a parser
//! avoids.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::ScannerConfig;
use crate::coverage::assertion::{
    self, AssertionKind, IdentifierArity, TestAssertion, normalize_target,
};
use crate::errors::DeployError;
use crate::events::{DeployEvent, EventSink, SharedSink};

const COMPONENT: &str = "PgTapTestScanner";

/// One discovered `.sql` test file plus the assertions recovered from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestFile {
    pub path: PathBuf,
    pub plan_count: Option<usize>,
    pub assertions: Vec<TestAssertion>,
}

/// The result of a scan, plus whether the 80%-of-ceiling memory
/// threshold was crossed partway through (spec.md §4.5). A caller that
/// sees `streaming == true` should build the [`crate::coverage::database::CoverageDatabase`]
/// with [`crate::coverage::database::CoverageDatabase::from_test_files_capped`]
/// instead of the uncapped constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub files: Vec<TestFile>,
    pub streaming: bool,
}

pub struct PgTapTestScanner {
    config: ScannerConfig,
    sink: SharedSink,
}

impl PgTapTestScanner {
    pub fn new(config: ScannerConfig, sink: SharedSink) -> Self {
        Self { config, sink }
    }

    pub fn max_objects_per_type(&self) -> usize {
        self.config.max_objects_per_type
    }

    /// Walks `test_dir`, applying the include/exclude globs, and parses
    /// each matched file. Files that cannot be read (permission errors,
    /// races with deletion) are skipped with a warning rather than
    /// aborting the whole scan, matching spec.md §4.5's streaming-mode
    /// resilience note.
    ///
    /// A `tests_dir` that does not exist at all is a technical failure
    /// (spec.md §8 S3/S4): the caller almost certainly misconfigured the
    /// path, and [`crate::coverage::orchestrator::TestCoverageOrchestrator`]
    /// routes this error through the bypass-or-fail-closed policy rather
    /// than silently reporting zero coverage. A directory that exists but
    /// holds no matching files — the fresh-project case spec.md §4.9
    /// describes — is not an error: it scans to an empty [`ScanOutcome`]
    /// so gaps surface normally.
    ///
    /// Returns every matched file regardless of memory pressure; it is
    /// [`ScanOutcome::streaming`], not file count, that tells the caller
    /// whether the configured ceiling was crossed and the database should
    /// be built with the per-category cap instead of unconditionally.
    pub fn scan(&self) -> Result<ScanOutcome, DeployError> {
        tracing::debug!(dir = %self.config.tests_dir.display(), "scanning for pgTAP test files");

        if !self.config.tests_dir.exists() {
            return Err(DeployError::TechnicalCoverage(format!(
                "tests directory does not exist: {}",
                self.config.tests_dir.display()
            )));
        }

        self.sink.emit(DeployEvent::Start {
            component: COMPONENT.to_string(),
            message: format!("scanning {}", self.config.tests_dir.display()),
        });

        let include = self.build_globset(&self.config.include)?;
        let exclude = self.build_globset(&self.config.exclude)?;

        let mut files = Vec::new();
        let mut batch_count = 0usize;
        let mut bytes_read: u64 = 0;
        let mut streaming = false;
        let ceiling_bytes = self.config.memory_ceiling_mb.saturating_mul(1_048_576);
        let streaming_threshold = ceiling_bytes.saturating_mul(80) / 100;

        for entry in WalkDir::new(&self.config.tests_dir)
            .follow_links(self.config.follow_symlinks)
            .max_depth(self.config.max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if path.extension().is_none_or(|ext| ext != "sql") {
                continue;
            }
            if is_hidden(path) && !self.config.include_hidden {
                continue;
            }
            let relative = path.strip_prefix(&self.config.tests_dir).unwrap_or(path);
            if !include.is_empty() && !include.is_match(relative) {
                continue;
            }
            if exclude.is_match(relative) {
                continue;
            }

            match self.scan_file(path) {
                Ok((file, content_len)) => {
                    bytes_read += content_len as u64;
                    files.push(file);
                }
                Err(err) => {
                    self.sink.emit(DeployEvent::Warning {
                        component: COMPONENT.to_string(),
                        message: format!("skipping {}: {err}", path.display()),
                    });
                }
            }

            if !streaming && streaming_threshold > 0 && bytes_read >= streaming_threshold {
                streaming = true;
                tracing::warn!(
                    heap_used_mb = bytes_read / 1_048_576,
                    ceiling_mb = self.config.memory_ceiling_mb,
                    "crossed 80% of memory ceiling, switching to streaming mode"
                );
                self.sink.emit(DeployEvent::MemoryStatus {
                    heap_used_mb: bytes_read / 1_048_576,
                    ceiling_mb: self.config.memory_ceiling_mb,
                    streaming: true,
                });
            }

            batch_count += 1;
            if batch_count % self.config.batch_size == 0 {
                self.sink.emit(DeployEvent::Progress {
                    component: COMPONENT.to_string(),
                    message: format!("scanned {batch_count} files"),
                });
            }
        }

        self.sink.emit(DeployEvent::Success {
            component: COMPONENT.to_string(),
            message: format!("found {} test files", files.len()),
        });
        Ok(ScanOutcome { files, streaming })
    }

    fn build_globset(&self, patterns: &[String]) -> Result<globset::GlobSet, DeployError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| DeployError::Parsing(format!("bad glob {pattern}: {e}")))?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| DeployError::Parsing(format!("bad globset: {e}")))
    }

    fn scan_file(&self, path: &Path) -> Result<(TestFile, usize), DeployError> {
        let content = std::fs::read_to_string(path)?;
        let plan_count = parse_plan_count(&content);
        let assertions = parse_assertions(&content, self.config.include_commented);
        if self.config.validate_plans {
            if let Some(plan) = plan_count {
                if plan != assertions.len() {
                    self.sink.emit(DeployEvent::Warning {
                        component: COMPONENT.to_string(),
                        message: format!(
                            "{}: plan({plan}) disagrees with {} observed assertions",
                            path.display(),
                            assertions.len()
                        ),
                    });
                }
            }
        }
        let content_len = content.len();
        Ok((
            TestFile {
                path: path.to_path_buf(),
                plan_count,
                assertions,
            },
            content_len,
        ))
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Finds `plan(N)` (pgTAP's test-count declaration) anywhere in the file.
fn parse_plan_count(content: &str) -> Option<usize> {
    let idx = content.find("plan(")?;
    let args = parse_call_args(content, idx + "plan(".len())?;
    args.first()?.trim().parse().ok()
}

/// Scans `content` line by line for every catalog assertion name,
/// skipping `--` line comments, and builds a [`TestAssertion`] per call.
fn parse_assertions(content: &str, include_commented: bool) -> Vec<TestAssertion> {
    let mut assertions = Vec::new();

    for (line_idx, line) in content.lines().enumerate() {
        let code = if include_commented {
            line
        } else {
            match line.find("--") {
                Some(pos) => &line[..pos],
                None => line,
            }
        };
        for kind in AssertionKind::ALL {
            let needle = format!("{}(", kind.as_str());
            let Some(pos) = code.find(needle.as_str()) else {
                continue;
            };
            // Require a non-identifier character (or start of line) before
            // the match so `has_table` doesn't fire on `my_has_table`.
            if pos > 0 {
                let prev = code.as_bytes()[pos - 1];
                if prev.is_ascii_alphanumeric() || prev == b'_' {
                    continue;
                }
            }
            let Some(raw_args) = parse_call_args(code, pos + needle.len()) else {
                continue;
            };
            assertions.push(build_assertion(*kind, raw_args, line_idx + 1, line.to_string()));
        }
    }
    assertions
}

fn build_assertion(
    kind: AssertionKind,
    args: Vec<String>,
    line_number: usize,
    raw_sql: String,
) -> TestAssertion {
    match kind.arity() {
        IdentifierArity::None => TestAssertion {
            kind,
            target: normalize_target("public", &["query_results"]),
            parameters: args,
            line_number,
            raw_sql,
            schema: None,
            table_name: None,
            description: None,
            function_metadata: None,
            policy_metadata: None,
        },
        IdentifierArity::Single => {
            let (schema, object, rest) = assertion::resolve_single(&args);
            let description = rest.last().cloned();
            TestAssertion {
                kind,
                target: normalize_target(&schema, &[&object]),
                parameters: rest,
                line_number,
                raw_sql,
                schema: Some(schema),
                table_name: Some(object),
                description,
                function_metadata: None,
                policy_metadata: None,
            }
        }
        IdentifierArity::Pair => {
            let (schema, parent, child, rest) = assertion::resolve_pair(&args);
            let description = rest.last().cloned();
            TestAssertion {
                kind,
                target: normalize_target(&schema, &[&parent, &child]),
                parameters: rest,
                line_number,
                raw_sql,
                schema: Some(schema),
                table_name: Some(parent),
                description,
                function_metadata: None,
                policy_metadata: None,
            }
        }
    }
}

/// Given `content` and the index just past an opening call name and `(`,
/// walks forward tracking nesting depth and single-quote state (pgTAP/SQL
/// strings double an embedded `'` rather than escaping with `\`), and
/// returns the top-level comma-separated argument list with surrounding
/// quotes stripped.
fn parse_call_args(content: &str, start: usize) -> Option<Vec<String>> {
    let bytes = content.as_bytes();
    let mut depth = 1i32;
    let mut in_string = false;
    let mut idx = start;
    let mut current = String::new();
    let mut args = Vec::new();

    while idx < bytes.len() {
        let c = bytes[idx] as char;
        if in_string {
            if c == '\'' {
                if bytes.get(idx + 1) == Some(&b'\'') {
                    current.push('\'');
                    idx += 2;
                    continue;
                }
                in_string = false;
                idx += 1;
                continue;
            }
            current.push(c);
            idx += 1;
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                idx += 1;
            }
            '(' => {
                depth += 1;
                current.push(c);
                idx += 1;
            }
            ')' => {
                depth -= 1;
                idx += 1;
                if depth == 0 {
                    if !current.trim().is_empty() {
                        args.push(current.trim().to_string());
                    }
                    return Some(args);
                }
                current.push(c);
            }
            ',' if depth == 1 => {
                args.push(current.trim().to_string());
                current.clear();
                idx += 1;
            }
            _ => {
                current.push(c);
                idx += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use std::sync::Arc;

    #[test]
    fn parses_plan_count() {
        assert_eq!(parse_plan_count("SELECT plan(12);"), Some(12));
        assert_eq!(parse_plan_count("SELECT * FROM no_plan_here;"), None);
    }

    #[test]
    fn parse_call_args_splits_top_level_commas() {
        let sql = "has_column('users', 'id', 'users has id');";
        let args = parse_call_args(sql, "has_column(".len()).unwrap();
        assert_eq!(args, vec!["users", "id", "users has id"]);
    }

    #[test]
    fn parse_call_args_respects_doubled_quote_escape() {
        let sql = "has_table('users', 'it''s the users table');";
        let args = parse_call_args(sql, "has_table(".len()).unwrap();
        assert_eq!(args[1], "it's the users table");
    }

    #[test]
    fn parse_assertions_finds_has_table_and_has_column() {
        let sql = "SELECT has_table('public', 'users');\nSELECT has_column('users', 'id');\n";
        let found = parse_assertions(sql, false);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].kind, AssertionKind::HasTable);
        assert_eq!(found[0].target, "public.users");
        assert_eq!(found[1].kind, AssertionKind::HasColumn);
        assert_eq!(found[1].target, "public.users.id");
    }

    #[test]
    fn parse_assertions_ignores_commented_out_calls() {
        let sql = "-- SELECT has_table('public', 'ghost');\nSELECT has_table('public', 'real');\n";
        let found = parse_assertions(sql, false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].table_name.as_deref(), Some("real"));
    }

    #[test]
    fn parse_assertions_does_not_match_prefixed_identifiers() {
        let sql = "SELECT my_has_table_helper('public', 'users');\n";
        assert!(parse_assertions(sql, false).is_empty());
    }

    #[test]
    fn scanner_skips_non_sql_and_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sql"), "SELECT has_table('public', 'a');").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "has_table('public', 'b');").unwrap();
        std::fs::write(dir.path().join(".hidden.sql"), "has_table('public', 'c');").unwrap();

        let config = ScannerConfig {
            tests_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let scanner = PgTapTestScanner::new(config, Arc::new(NullSink));
        let outcome = scanner.scan().unwrap();
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].assertions.len(), 1);
        assert!(!outcome.streaming);
    }

    #[test]
    fn crossing_the_memory_ceiling_switches_to_streaming() {
        let dir = tempfile::tempdir().unwrap();
        // One file large enough to cross 80% of a 1MB ceiling on its own.
        std::fs::write(
            dir.path().join("a.sql"),
            "SELECT has_table('public', 'a');\n".repeat(30_000),
        )
        .unwrap();

        let config = ScannerConfig {
            tests_dir: dir.path().to_path_buf(),
            memory_ceiling_mb: 1,
            ..Default::default()
        };
        let scanner = PgTapTestScanner::new(config, Arc::new(NullSink));
        let outcome = scanner.scan().unwrap();
        assert!(outcome.streaming);
    }

    #[test]
    fn zero_ceiling_never_triggers_streaming() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sql"), "SELECT has_table('public', 'a');\n").unwrap();

        let config = ScannerConfig {
            tests_dir: dir.path().to_path_buf(),
            memory_ceiling_mb: 0,
            ..Default::default()
        };
        let scanner = PgTapTestScanner::new(config, Arc::new(NullSink));
        let outcome = scanner.scan().unwrap();
        assert!(!outcome.streaming);
    }

    #[test]
    fn scanning_a_nonexistent_directory_is_a_technical_failure() {
        let config = ScannerConfig {
            tests_dir: PathBuf::from("/does/not/exist/anywhere"),
            ..Default::default()
        };
        let scanner = PgTapTestScanner::new(config, Arc::new(NullSink));
        let err = scanner.scan().unwrap_err();
        assert_eq!(err.kind(), "technical_coverage");
    }

    #[test]
    fn scanning_an_empty_existing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScannerConfig {
            tests_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let scanner = PgTapTestScanner::new(config, Arc::new(NullSink));
        let outcome = scanner.scan().unwrap();
        assert!(outcome.files.is_empty());
    }
}
