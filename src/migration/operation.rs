//! [`MigrationOperation`] and [`OperationBatch`].
//!
//! Operations arrive from an upstream analyzer as opaque `{sql, type,
//! description}` triples — this crate never parses SQL into an AST.

use serde::{Deserialize, Serialize};

/// How destructive an operation is, and by extension how much ceremony
/// it demands before execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Safe,
    Warning,
    Destructive,
}

/// A single unit of SQL to execute as part of a migration. The SQL text
/// itself is opaque to this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationOperation {
    pub sql: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub requires_confirmation: bool,
}

impl MigrationOperation {
    pub fn safe(sql: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: OperationKind::Safe,
            description: description.into(),
            warning: None,
            requires_confirmation: false,
        }
    }

    pub fn destructive(
        sql: impl Into<String>,
        description: impl Into<String>,
        warning: impl Into<String>,
    ) -> Self {
        Self {
            sql: sql.into(),
            kind: OperationKind::Destructive,
            description: description.into(),
            warning: Some(warning.into()),
            requires_confirmation: true,
        }
    }

    pub fn is_destructive(&self) -> bool {
        self.kind == OperationKind::Destructive
    }
}

/// An ordered sequence of operations. Order is execution order.
pub type OperationBatch = Vec<MigrationOperation>;

/// Validates the precondition required before derivation can run: every
/// operation's `sql` must be non-empty and of reasonable length. Upstream
/// sloppiness must not silently become missing tests, so this fails fast
/// rather than skipping the offending operation.
pub fn validate_operations(operations: &[MigrationOperation]) -> Result<(), crate::errors::DeployError> {
    const MAX_SQL_LEN: usize = 100_000;
    for (index, operation) in operations.iter().enumerate() {
        if operation.sql.trim().is_empty() {
            return Err(crate::errors::DeployError::Validation(format!(
                "operation {index} (\"{}\") has an empty sql field",
                operation.description
            )));
        }
        if operation.sql.len() > MAX_SQL_LEN {
            return Err(crate::errors::DeployError::Validation(format!(
                "operation {index} (\"{}\") exceeds the {MAX_SQL_LEN}-character sql limit",
                operation.description
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sql_fails_validation() {
        let operations = vec![MigrationOperation::safe("", "nothing")];
        let err = validate_operations(&operations).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn oversized_sql_fails_validation() {
        let operations = vec![MigrationOperation::safe("x".repeat(100_001), "huge")];
        assert!(validate_operations(&operations).is_err());
    }

    #[test]
    fn reasonable_sql_passes() {
        let operations = vec![MigrationOperation::safe("CREATE TABLE t();", "create t")];
        assert!(validate_operations(&operations).is_ok());
    }
}
