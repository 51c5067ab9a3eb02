//! `data-deploy` drives a Postgres schema deployment from a Git-tracked
//! tree of golden SQL: it checks working-tree readiness, compiles or
//! diffs migrations, enforces pgTAP coverage, and tags the commit that
//! was deployed.
//!
//! The crate is a library; [`orchestrator::Orchestrator`] is the single
//! entry point a caller drives, composing the collaborators in every
//! other module.

pub mod child_process;
pub mod config;
pub mod coverage;
pub mod errors;
pub mod events;
pub mod git;
pub mod migration;
pub mod orchestrator;
