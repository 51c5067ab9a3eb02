//! [`TestRequirementAnalyzer`]: derives what tests a batch of migration
//! operations demands (spec.md §4.6).
//!
//! This is deliberately not a SQL parser (spec.md §1 Non-goals): it scans
//! opaque operation text for a closed set of DDL shapes using the same
//! hand-written find-and-slice style as [`crate::coverage::scanner`],
//! rather than a regex catalog.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::coverage::database::GapPriority;
use crate::migration::operation::{MigrationOperation, OperationKind, validate_operations};

/// The closed set of requirement types spec.md §3 enumerates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Rpc,
    Rls,
    Trigger,
    Constraint,
    Function,
    Table,
    Column,
    Index,
}

/// A single derived test requirement (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRequirement {
    #[serde(rename = "type")]
    pub kind: RequirementKind,
    pub name: String,
    pub schema: String,
    pub priority: GapPriority,
    #[serde(default)]
    pub metadata: Value,
}

impl TestRequirement {
    fn new(kind: RequirementKind, name: impl Into<String>, priority: GapPriority) -> Self {
        Self {
            kind,
            name: name.into(),
            schema: "public".to_string(),
            priority,
            metadata: Value::Null,
        }
    }

    fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Tallies by priority, returned alongside the requirement list
/// (spec.md §4.6).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequirementSummary {
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
}

impl RequirementSummary {
    fn record(&mut self, priority: GapPriority) {
        match priority {
            GapPriority::Critical => self.critical_count += 1,
            GapPriority::High => self.high_count += 1,
            GapPriority::Medium => self.medium_count += 1,
            GapPriority::Low => self.low_count += 1,
        }
    }
}

/// Derives the requirement list for a batch of operations. Fails fast if
/// any operation fails the §4.6 precondition (non-empty `sql`, reasonable
/// length) — upstream sloppiness must not silently become missing tests.
pub fn analyze(
    operations: &[MigrationOperation],
) -> Result<(Vec<TestRequirement>, RequirementSummary), crate::errors::DeployError> {
    validate_operations(operations)?;

    let mut requirements = Vec::new();
    for operation in operations {
        requirements.extend(derive_requirements(operation));
    }

    let mut summary = RequirementSummary::default();
    for requirement in &requirements {
        summary.record(requirement.priority);
    }
    Ok((requirements, summary))
}

fn derive_requirements(operation: &MigrationOperation) -> Vec<TestRequirement> {
    let sql = &operation.sql;
    let mut found = Vec::new();

    if let Some(table) = find_create_table(sql) {
        found.push(TestRequirement::new(
            RequirementKind::Table,
            table,
            GapPriority::Critical,
        ));
    }

    if let Some((table, column)) = find_add_column(sql) {
        found.push(TestRequirement::new(
            RequirementKind::Column,
            format!("{table}.{column}"),
            GapPriority::High,
        ));
    }

    if let Some((name, security_definer)) = find_create_function(sql) {
        if security_definer {
            found.push(TestRequirement::new(
                RequirementKind::Function,
                name.clone(),
                GapPriority::Critical,
            ));
            found.push(
                TestRequirement::new(RequirementKind::Function, name, GapPriority::Critical)
                    .with_metadata(json!({ "check": "privileges", "reason": "security definer" })),
            );
        } else {
            found.push(TestRequirement::new(
                RequirementKind::Function,
                name,
                GapPriority::High,
            ));
        }
    }

    if let Some(index) = find_create_index(sql) {
        found.push(TestRequirement::new(
            RequirementKind::Index,
            index,
            GapPriority::Medium,
        ));
    }

    if let Some(table) = find_rls(sql) {
        found.push(TestRequirement::new(
            RequirementKind::Rls,
            table,
            GapPriority::Critical,
        ));
    }

    if let Some(trigger) = find_create_trigger(sql) {
        found.push(TestRequirement::new(
            RequirementKind::Trigger,
            trigger,
            GapPriority::High,
        ));
    }

    if let Some(table) = find_check_constraint(sql) {
        found.push(TestRequirement::new(
            RequirementKind::Constraint,
            table,
            GapPriority::Medium,
        ));
    }

    // spec.md §4.6: anything DESTRUCTIVE-tagged always becomes critical,
    // regardless of what shape of requirement it produced above.
    if operation.kind == OperationKind::Destructive {
        for requirement in &mut found {
            requirement.priority = GapPriority::Critical;
        }
    }

    found
}

/// Finds the next identifier token starting at or after `from`, skipping
/// whitespace, an optional schema-qualifier (`schema.name` -> `name`),
/// and surrounding quotes. Stops at whitespace, `(`, or `;`.
fn next_identifier(sql: &str, from: usize) -> Option<(String, usize)> {
    let bytes = sql.as_bytes();
    let mut idx = from;
    while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
        idx += 1;
    }
    // Skip a leading "IF NOT EXISTS" / "IF EXISTS" clause.
    for clause in ["if not exists", "if exists"] {
        if sql[idx..].to_ascii_lowercase().starts_with(clause) {
            idx += clause.len();
            while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
                idx += 1;
            }
        }
    }
    let start = idx;
    while idx < bytes.len() {
        let c = bytes[idx] as char;
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '"' {
            idx += 1;
        } else {
            break;
        }
    }
    if idx == start {
        return None;
    }
    let raw = &sql[start..idx];
    let name = raw.rsplit('.').next().unwrap_or(raw).replace('"', "");
    if name.is_empty() {
        return None;
    }
    Some((name, idx))
}

/// Case-insensitive search for `needle`, returning the byte offset just
/// past the match, or `None`.
fn find_after(haystack: &str, needle: &str) -> Option<usize> {
    let lower = haystack.to_ascii_lowercase();
    lower.find(needle).map(|pos| pos + needle.len())
}

fn find_create_table(sql: &str) -> Option<String> {
    let after = find_after(sql, "create table")?;
    next_identifier(sql, after).map(|(name, _)| name)
}

fn find_add_column(sql: &str) -> Option<(String, String)> {
    let after_alter = find_after(sql, "alter table")?;
    let (table, end) = next_identifier(sql, after_alter)?;
    let after_add = find_after(&sql[end..], "add column")?;
    let (column, _) = next_identifier(&sql[end..], after_add)?;
    Some((table, column))
}

fn find_create_function(sql: &str) -> Option<(String, bool)> {
    let after = find_after(sql, "create or replace function")
        .or_else(|| find_after(sql, "create function"))?;
    let (name, _) = next_identifier(sql, after)?;
    let security_definer = sql.to_ascii_lowercase().contains("security definer");
    Some((name, security_definer))
}

fn find_create_index(sql: &str) -> Option<String> {
    let after = find_after(sql, "create unique index")
        .or_else(|| find_after(sql, "create index"))?;
    let (name, end) = next_identifier(sql, after)?;
    match find_after(&sql[end..], " on ").and_then(|on| next_identifier(&sql[end..], on)) {
        Some((table, _)) => Some(format!("{table}.{name}")),
        None => Some(name),
    }
}

fn find_rls(sql: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    if lower.contains("enable row level security") {
        let after = find_after(sql, "alter table")?;
        let (table, _) = next_identifier(sql, after)?;
        return Some(table);
    }
    if let Some(after) = find_after(sql, "create policy") {
        let (_, end) = next_identifier(sql, after)?;
        let on = find_after(&sql[end..], " on ")?;
        let (table, _) = next_identifier(&sql[end..], on)?;
        return Some(table);
    }
    None
}

fn find_create_trigger(sql: &str) -> Option<String> {
    let after = find_after(sql, "create trigger")
        .or_else(|| find_after(sql, "create or replace trigger"))?;
    let (name, end) = next_identifier(sql, after)?;
    match find_after(&sql[end..], " on ").and_then(|on| next_identifier(&sql[end..], on)) {
        Some((table, _)) => Some(format!("{table}.{name}")),
        None => Some(name),
    }
}

fn find_check_constraint(sql: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    if !lower.contains("check (") && !lower.contains("check(") {
        return None;
    }
    find_create_table(sql).or_else(|| {
        find_after(sql, "alter table").and_then(|after| next_identifier(sql, after).map(|(n, _)| n))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::operation::MigrationOperation;

    #[test]
    fn create_table_yields_critical_table_requirement() {
        let op = MigrationOperation::safe(
            "CREATE TABLE users(id int primary key, email text);",
            "create users",
        );
        let (reqs, summary) = analyze(&[op]).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].kind, RequirementKind::Table);
        assert_eq!(reqs[0].name, "users");
        assert_eq!(reqs[0].priority, GapPriority::Critical);
        assert_eq!(summary.critical_count, 1);
    }

    #[test]
    fn add_column_yields_high_priority_dotted_name() {
        let op = MigrationOperation::safe(
            "ALTER TABLE users ADD COLUMN age int;",
            "add age",
        );
        let (reqs, _) = analyze(&[op]).unwrap();
        assert_eq!(reqs[0].kind, RequirementKind::Column);
        assert_eq!(reqs[0].name, "users.age");
        assert_eq!(reqs[0].priority, GapPriority::High);
    }

    #[test]
    fn security_definer_function_upgrades_to_critical_and_adds_privilege_requirement() {
        let op = MigrationOperation::safe(
            "CREATE FUNCTION do_admin_thing() RETURNS void LANGUAGE plpgsql SECURITY DEFINER AS $$ BEGIN END; $$;",
            "admin fn",
        );
        let (reqs, summary) = analyze(&[op]).unwrap();
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|r| r.priority == GapPriority::Critical));
        assert_eq!(summary.critical_count, 2);
    }

    #[test]
    fn plain_function_is_high_priority() {
        let op = MigrationOperation::safe(
            "CREATE FUNCTION touch_updated_at() RETURNS trigger LANGUAGE plpgsql AS $$ BEGIN END; $$;",
            "fn",
        );
        let (reqs, _) = analyze(&[op]).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].priority, GapPriority::High);
    }

    #[test]
    fn rls_policy_and_enable_both_name_the_table() {
        let enable = MigrationOperation::safe(
            "ALTER TABLE users ENABLE ROW LEVEL SECURITY;",
            "enable rls",
        );
        let policy = MigrationOperation::safe(
            "CREATE POLICY users_select_own ON users FOR SELECT USING (auth.uid() = id);",
            "policy",
        );
        let (reqs, summary) = analyze(&[enable, policy]).unwrap();
        assert_eq!(reqs.len(), 2);
        assert!(reqs.iter().all(|r| r.kind == RequirementKind::Rls));
        assert!(reqs.iter().all(|r| r.name == "users"));
        assert_eq!(summary.critical_count, 2);
    }

    #[test]
    fn create_index_is_medium_priority() {
        let op = MigrationOperation::safe(
            "CREATE INDEX idx_users_email ON users(email);",
            "index",
        );
        let (reqs, _) = analyze(&[op]).unwrap();
        assert_eq!(reqs[0].kind, RequirementKind::Index);
        assert_eq!(reqs[0].name, "users.idx_users_email");
        assert_eq!(reqs[0].priority, GapPriority::Medium);
    }

    #[test]
    fn create_trigger_names_table_and_trigger() {
        let op = MigrationOperation::safe(
            "CREATE TRIGGER set_updated_at BEFORE UPDATE ON users FOR EACH ROW EXECUTE FUNCTION touch_updated_at();",
            "trigger",
        );
        let (reqs, _) = analyze(&[op]).unwrap();
        assert_eq!(reqs[0].kind, RequirementKind::Trigger);
        assert_eq!(reqs[0].name, "users.set_updated_at");
    }

    #[test]
    fn destructive_operation_forces_critical_priority() {
        let op = MigrationOperation::destructive(
            "CREATE INDEX idx_x ON t(x);",
            "index on destructive op",
            "reindexing large table",
        );
        let (reqs, _) = analyze(&[op]).unwrap();
        assert_eq!(reqs[0].priority, GapPriority::Critical);
    }

    #[test]
    fn empty_sql_fails_fast_rather_than_skipping() {
        let op = MigrationOperation::safe("", "broken");
        let err = analyze(&[op]).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn check_constraint_is_detected() {
        let op = MigrationOperation::safe(
            "ALTER TABLE users ADD CONSTRAINT age_positive CHECK (age > 0);",
            "check",
        );
        let (reqs, _) = analyze(&[op]).unwrap();
        assert!(reqs.iter().any(|r| r.kind == RequirementKind::Constraint));
    }
}
