//! Git-as-deployment-ledger: the tracker that owns every `git` invocation,
//! plus the value types it returns.

pub mod status;
pub mod tag;
pub mod tracker;

pub use status::{DeploymentReadiness, WorkingTreeStatus};
pub use tag::DeploymentTag;
pub use tracker::{GitDeploymentTracker, GitRef};
