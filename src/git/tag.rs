//! The [`DeploymentTag`] value type and its JSON metadata convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An annotated Git tag created by [`super::tracker::GitDeploymentTracker`].
///
/// Only annotated tags are ever constructed or recognized here;
/// lightweight tags are ignored by every reader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentTag {
    /// Full tag name, e.g. `data-deploy-20260727120000-migration_abc123`.
    pub name: String,
    pub commit_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Free-form JSON document stored as the annotation body. By
    /// convention contains `{migrationId, operations, timestamp,
    /// environment}`.
    pub metadata: Value,
}

impl DeploymentTag {
    /// By convention, tags recording a rollback are named
    /// `rollback-<timestamp>-from-<previousTag>`.
    pub fn is_rollback_tag(name: &str) -> bool {
        name.starts_with("rollback-")
    }
}

/// Metadata shape recorded in every forward deployment tag. The
/// orchestrator's `MigrationRecord` reuses the same fields for consistency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentMetadata {
    pub migration_id: String,
    pub operations: usize,
    pub timestamp: DateTime<Utc>,
    pub environment: String,
}

impl DeploymentMetadata {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("DeploymentMetadata always serializes")
    }
}
