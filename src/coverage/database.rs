//! [`CoverageDatabase`]: the in-memory index of assertions observed by
//! the scanner, keyed by schema object and the gap computation run
//! against it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::coverage::assertion::{AssertionKind, ObjectCategory, TestAssertion};
use crate::coverage::scanner::TestFile;
use crate::events::{DeployEvent, EventSink};

/// Every assertion seen for one target object, plus which assertion
/// kinds have been observed at least once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CoverageEntry {
    pub target: String,
    pub category: Option<ObjectCategory>,
    pub assertions: Vec<TestAssertion>,
    pub kinds_present: Vec<AssertionKind>,
}

impl CoverageEntry {
    fn record(&mut self, assertion: TestAssertion) {
        if !self.kinds_present.contains(&assertion.kind) {
            self.kinds_present.push(assertion.kind);
        }
        self.category = Some(assertion.kind.category());
        self.assertions.push(assertion);
    }

    pub fn has_kind(&self, kind: AssertionKind) -> bool {
        self.kinds_present.contains(&kind)
    }

    pub fn assertion_count(&self) -> usize {
        self.assertions.len()
    }
}

/// A single missing-coverage finding, referenced from
/// [`crate::events::DeployEvent::EnforcementFailed`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageGap {
    pub target: String,
    pub category: ObjectCategory,
    pub missing_kinds: Vec<AssertionKind>,
    pub priority: GapPriority,
}

/// How severely a missing assertion kind should weigh in an enforcement
/// decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GapPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// The full set of targets the scanner discovered, indexed for O(1)
/// lookup by target and grouped by category.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CoverageDatabase {
    entries: HashMap<String, CoverageEntry>,
    total_assertions: usize,
    total_files: usize,
}

impl CoverageDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a database from every test file the scanner found.
    pub fn from_test_files(files: &[TestFile]) -> Self {
        let mut db = Self::new();
        for file in files {
            db.total_files += 1;
            for assertion in &file.assertions {
                db.total_assertions += 1;
                db.entries
                    .entry(assertion.target.clone())
                    .or_insert_with(|| CoverageEntry {
                        target: assertion.target.clone(),
                        ..Default::default()
                    })
                    .record(assertion.clone());
            }
        }
        db
    }

    /// Builds a database the same way as [`Self::from_test_files`], but
    /// once a category (table, index, function, ...) has accumulated
    /// `max_objects_per_type` distinct targets, further targets in that
    /// category are dropped with a warning instead of inserted. Used in
    /// streaming mode once the scanner crosses its memory ceiling.
    pub fn from_test_files_capped(
        files: &[TestFile],
        max_objects_per_type: usize,
        sink: &dyn EventSink,
    ) -> Self {
        let mut db = Self::new();
        let mut category_counts: HashMap<ObjectCategory, usize> = HashMap::new();
        for file in files {
            db.total_files += 1;
            for assertion in &file.assertions {
                let category = assertion.kind.category();
                if !db.entries.contains_key(&assertion.target) {
                    let count = category_counts.entry(category).or_insert(0);
                    if *count >= max_objects_per_type {
                        sink.emit(DeployEvent::Warning {
                            component: "CoverageDatabase".to_string(),
                            message: format!(
                                "{category:?} object cap ({max_objects_per_type}) reached, dropping {}",
                                assertion.target
                            ),
                        });
                        continue;
                    }
                    *count += 1;
                }
                db.total_assertions += 1;
                db.entries
                    .entry(assertion.target.clone())
                    .or_insert_with(|| CoverageEntry {
                        target: assertion.target.clone(),
                        ..Default::default()
                    })
                    .record(assertion.clone());
            }
        }
        db
    }

    pub fn entry(&self, target: &str) -> Option<&CoverageEntry> {
        self.entries.get(target)
    }

    pub fn entries_in(&self, category: ObjectCategory) -> impl Iterator<Item = &CoverageEntry> {
        self.entries
            .values()
            .filter(move |e| e.category == Some(category))
    }

    pub fn total_assertions(&self) -> usize {
        self.total_assertions
    }

    pub fn total_files(&self) -> usize {
        self.total_files
    }

    pub fn target_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::assertion::normalize_target;
    use std::path::PathBuf;

    fn assertion(kind: AssertionKind, target: &str) -> TestAssertion {
        TestAssertion {
            kind,
            target: target.to_string(),
            parameters: Vec::new(),
            line_number: 1,
            raw_sql: String::new(),
            schema: None,
            table_name: None,
            description: None,
            function_metadata: None,
            policy_metadata: None,
        }
    }

    #[test]
    fn builds_entries_from_test_files() {
        let target = normalize_target("public", &["users"]);
        let files = vec![TestFile {
            path: PathBuf::from("t.sql"),
            plan_count: Some(2),
            assertions: vec![
                assertion(AssertionKind::HasTable, &target),
                assertion(AssertionKind::HasPk, &target),
            ],
        }];
        let db = CoverageDatabase::from_test_files(&files);
        assert_eq!(db.total_assertions(), 2);
        assert_eq!(db.target_count(), 1);
        let entry = db.entry(&target).unwrap();
        assert!(entry.has_kind(AssertionKind::HasTable));
        assert!(entry.has_kind(AssertionKind::HasPk));
        assert_eq!(entry.category, Some(ObjectCategory::Tables));
    }

    #[test]
    fn capped_builder_drops_targets_beyond_the_per_category_cap() {
        use crate::events::NullSink;

        let files = vec![TestFile {
            path: PathBuf::from("t.sql"),
            plan_count: None,
            assertions: vec![
                assertion(AssertionKind::HasTable, "public.users"),
                assertion(AssertionKind::HasTable, "public.accounts"),
                assertion(AssertionKind::HasTable, "public.sessions"),
            ],
        }];
        let db = CoverageDatabase::from_test_files_capped(&files, 2, &NullSink);
        assert_eq!(db.target_count(), 2);
        assert_eq!(db.total_assertions(), 2);
    }

    #[test]
    fn entries_in_filters_by_category() {
        let files = vec![TestFile {
            path: PathBuf::from("t.sql"),
            plan_count: None,
            assertions: vec![
                assertion(AssertionKind::HasTable, "public.users"),
                assertion(AssertionKind::HasFunction, "public.do_thing"),
            ],
        }];
        let db = CoverageDatabase::from_test_files(&files);
        assert_eq!(db.entries_in(ObjectCategory::Tables).count(), 1);
        assert_eq!(db.entries_in(ObjectCategory::Functions).count(), 1);
        assert_eq!(db.entries_in(ObjectCategory::Indexes).count(), 0);
    }
}
