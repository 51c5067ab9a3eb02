//! [`DiffEngine`]: derives an incremental migration document by comparing
//! SQL state between two Git refs.
//!
//! The engine itself never invokes `git` — [`crate::git::GitDeploymentTracker`]
//! is the sole component permitted to do that. Instead the engine is a
//! pure function over blob contents that the caller fetches through the
//! tracker, which keeps it unit-testable without a real repository: a
//! pure text-in/text-out component built on `similar`.

use similar::{ChangeTag, TextDiff};

use crate::config::DiffEngineConfig;
use crate::errors::DeployError;
use crate::git::tracker::{GitDeploymentTracker, GitRef};

/// One file's worth of added or removed text, alongside its path.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffItem {
    pub path: String,
    pub data: String,
}

/// The three buckets a Git diff is grouped into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffBuckets {
    pub additions: Vec<DiffItem>,
    pub deletions: Vec<DiffItem>,
    pub modifications: Vec<DiffItem>,
}

pub struct DiffEngine {
    config: DiffEngineConfig,
}

impl DiffEngine {
    pub fn new(config: DiffEngineConfig) -> Self {
        Self { config }
    }

    /// Fetches the three buckets of changed files between `from` and `to`
    /// via the tracker, then classifies and diffs each one.
    pub async fn diff_refs(
        &self,
        tracker: &GitDeploymentTracker,
        from: &GitRef,
        to: &GitRef,
    ) -> Result<DiffBuckets, DeployError> {
        let changes = tracker.get_changes_between_commits(from, to).await?;
        let mut buckets = DiffBuckets::default();

        for (path, status) in changes {
            match status {
                'A' => {
                    let new_content = tracker.show_blob(to, &path).await?.unwrap_or_default();
                    buckets.additions.push(DiffItem {
                        path,
                        data: new_content,
                    });
                }
                'D' => {
                    if !self.config.include_drop_statements {
                        continue;
                    }
                    let old_content = tracker.show_blob(from, &path).await?.unwrap_or_default();
                    buckets.deletions.push(DiffItem {
                        path,
                        data: old_content,
                    });
                }
                'M' | 'R' | 'C' | 'T' => {
                    let old_content = tracker.show_blob(from, &path).await?.unwrap_or_default();
                    let new_content = tracker.show_blob(to, &path).await?.unwrap_or_default();
                    let data = self.unified_diff(&old_content, &new_content);
                    buckets.modifications.push(DiffItem { path, data });
                }
                _ => {}
            }
        }

        Ok(buckets)
    }

    /// Computes a Myers-based unified diff between two file contents using
    /// `similar::TextDiff`.
    fn unified_diff(&self, old: &str, new: &str) -> String {
        let diff = TextDiff::from_lines(old, new);
        let mut out = String::new();
        for change in diff.iter_all_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            out.push_str(sign);
            out.push_str(change.value());
            if !change.value().ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }

    /// Renders the three buckets as a single textual migration document
    /// with section banners, applying the (intentionally narrow) column-
    /// add rewrite heuristic to each modification.
    pub fn render_migration_document(&self, buckets: &DiffBuckets) -> String {
        let mut doc = String::new();

        doc.push_str("-- ==== ADDITIONS ====\n\n");
        for item in &buckets.additions {
            doc.push_str(&format!("-- File: {}\n", item.path));
            doc.push_str(&item.data);
            if !item.data.ends_with('\n') {
                doc.push('\n');
            }
            doc.push('\n');
        }

        doc.push_str("-- ==== MODIFICATIONS ====\n\n");
        for item in &buckets.modifications {
            doc.push_str(&format!("-- File: {}\n", item.path));
            match self.rewrite_alter_column(&item.path, &item.data) {
                Some(alter) => doc.push_str(&alter),
                None => doc.push_str(&item.data),
            }
            doc.push('\n');
        }

        if self.config.include_drop_statements {
            doc.push_str("-- ==== DELETIONS ====\n\n");
            for item in &buckets.deletions {
                doc.push_str(&format!(
                    "-- File: {}\n-- WARNING: manual review required for DROP\n",
                    item.path
                ));
                for line in item.data.lines() {
                    doc.push_str("-- ");
                    doc.push_str(line);
                    doc.push('\n');
                }
                doc.push('\n');
            }
        }

        doc
    }

    /// A narrow pattern rewrite, a design choice rather than a promise: if
    /// an added line looks like a bare column definition (`<ident> <type>
    /// ...`) and the file path ends in `<table>.sql`, emit an `ALTER TABLE
    /// ... ADD COLUMN` statement. Anything else returns `None` so the
    /// caller falls back to the annotated diff. This intentionally stays a
    /// hand-rolled scanner rather than a regex catalog, to avoid
    /// regex-driven ambiguity.
    fn rewrite_alter_column(&self, path: &str, diff_text: &str) -> Option<String> {
        let table = std::path::Path::new(path).file_stem()?.to_str()?;

        for line in diff_text.lines() {
            let Some(added) = line.strip_prefix('+') else {
                continue;
            };
            if let Some((column, column_type)) = parse_column_definition(added) {
                return Some(format!(
                    "ALTER TABLE {table} ADD COLUMN {column} {column_type};\n"
                ));
            }
        }
        None
    }
}

/// Recognizes a line shaped like `    email text` or `  age integer not null`
/// — leading whitespace, an identifier, then a type token — without
/// reaching for a regex engine. Returns `(column, type)` on a match.
fn parse_column_definition(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed == line {
        // No leading whitespace: not a column-shaped addition.
        return None;
    }
    let mut tokens = trimmed.split_whitespace();
    let column = tokens.next()?;
    let column_type = tokens.next()?;

    let is_identifier = |s: &str| {
        !s.is_empty()
            && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if !is_identifier(column) || !is_identifier(column_type) {
        return None;
    }
    Some((column.to_string(), column_type.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(include_drops: bool) -> DiffEngine {
        DiffEngine::new(DiffEngineConfig {
            sql_dir: "sql".into(),
            include_drop_statements: include_drops,
        })
    }

    #[test]
    fn recognizes_bare_column_addition() {
        let parsed = parse_column_definition("    email text");
        assert_eq!(parsed, Some(("email".to_string(), "text".to_string())));
    }

    #[test]
    fn rejects_lines_without_leading_whitespace() {
        assert_eq!(parse_column_definition("CREATE TABLE users ("), None);
    }

    #[test]
    fn rewrite_alter_column_emits_alter_table() {
        let engine = engine(true);
        let diff = "-CREATE TABLE users (\n+CREATE TABLE users (\n+    id int,\n+    email text\n+);\n";
        let rewritten = engine.rewrite_alter_column("sql/001_tables/users.sql", diff);
        assert_eq!(
            rewritten,
            Some("ALTER TABLE users ADD COLUMN id int;\n".to_string())
        );
    }

    #[test]
    fn complex_modification_falls_back_to_annotated_diff() {
        let engine = engine(true);
        let diff = "-SELECT 1;\n+SELECT 1 WHERE id = (SELECT max(id) FROM other);\n";
        assert_eq!(engine.rewrite_alter_column("sql/x.sql", diff), None);
    }

    #[test]
    fn deletions_are_suppressed_when_configured() {
        let engine = engine(false);
        let buckets = DiffBuckets {
            deletions: vec![DiffItem {
                path: "sql/x.sql".to_string(),
                data: "DROP TABLE x;\n".to_string(),
            }],
            ..Default::default()
        };
        let doc = engine.render_migration_document(&buckets);
        assert!(!doc.contains("DELETIONS"));
    }

    #[test]
    fn deletions_always_carry_a_manual_review_warning() {
        let engine = engine(true);
        let buckets = DiffBuckets {
            deletions: vec![DiffItem {
                path: "sql/x.sql".to_string(),
                data: "old_table definition\n".to_string(),
            }],
            ..Default::default()
        };
        let doc = engine.render_migration_document(&buckets);
        assert!(doc.contains("WARNING: manual review required for DROP"));
        assert!(!doc.contains("\nDROP "));
    }

    #[test]
    fn unified_diff_marks_insertions_and_deletions() {
        let engine = engine(true);
        let diff = engine.unified_diff("a\nb\n", "a\nc\n");
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
        assert!(diff.contains(" a"));
    }
}
