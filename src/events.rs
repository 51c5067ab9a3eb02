//! The single typed event hierarchy for the whole crate. Every component
//! emits [`DeployEvent`] through an [`EventSink`]; none inspects another
//! component's payload shape.
//!
//! Events are observational only and must never change control flow.
//! Treat [`tracing`] calls made alongside an emitted event as a second,
//! independent rendering of the same fact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coverage::database::CoverageGap;
use crate::migration::operation::MigrationOperation;

/// One of the kinds a component can emit over the course of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeployEvent {
    /// A phase or sub-operation has started.
    Start { component: String, message: String },
    /// Incremental progress within a phase (file processed, batch
    /// complete, tag fetched, ...).
    Progress { component: String, message: String },
    /// A recoverable, non-blocking condition (skipped file, missing
    /// remote, plan-count mismatch, ...).
    Warning { component: String, message: String },
    /// A phase failed. Carries the same message a [`crate::errors::DeployError`]
    /// would render, without requiring the listener to downcast an error.
    Error { component: String, message: String },
    /// A sub-operation completed successfully.
    Success { component: String, message: String },
    /// The whole deployment reached a terminal state.
    Complete { deployed: bool, message: String },
    /// The deployment was cancelled.
    Cancelled { phase: String },
    /// The orchestrator is asking for human confirmation.
    Prompt { message: String, destructive: bool },
    /// A structured preview of the pending change set, emitted before a
    /// forward deploy or a rollback asks for confirmation.
    Preview {
        operation_count: usize,
        destructive_count: usize,
        estimated_duration_secs: u64,
    },
    /// Coverage enforcement blocked the deployment.
    EnforcementFailed {
        coverage_percentage: u8,
        gaps: Vec<CoverageGap>,
    },
    /// Coverage enforcement was bypassed with an explicit reason.
    EnforcementBypassed { reason: String },
    /// Scanner memory-pressure status.
    MemoryStatus {
        heap_used_mb: u64,
        ceiling_mb: u64,
        streaming: bool,
    },
    /// Resources were released at the end of a phase or run.
    Cleanup { component: String },
    /// A single migration statement is about to be executed, in order.
    OperationExecuting {
        operation: MigrationOperation,
        index: usize,
        total: usize,
    },
    /// The migration phase committed to the database while the
    /// `functions` phase has not yet run.
    PartialCommitWindow { migration_id: String },
}

impl DeployEvent {
    pub fn timestamped(self) -> TimestampedEvent {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

/// An event paired with the wall-clock time it was emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimestampedEvent {
    pub timestamp: DateTime<Utc>,
    pub event: DeployEvent,
}

/// Anything that can receive the event stream. Implementors must not
/// block the emitting phase for long; a channel-backed sink is provided
/// for that reason.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DeployEvent);
}

/// A sink that discards every event. Useful for library callers that only
/// care about the returned `Result`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: DeployEvent) {}
}

/// A sink backed by an unbounded `tokio::sync::mpsc` channel, so an async
/// reporter can drain events without the emitting phase ever blocking on
/// a full channel.
#[derive(Clone)]
pub struct ChannelSink {
    sender: tokio::sync::mpsc::UnboundedSender<TimestampedEvent>,
}

impl ChannelSink {
    /// Creates a connected sink/receiver pair.
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<TimestampedEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: DeployEvent) {
        // A closed receiver just means nobody is listening anymore;
        // dropping the event is correct since events never gate control
        // flow.
        let _ = self.sender.send(event.timestamped());
    }
}

/// Convenience alias for passing a shared sink through owned collaborators
/// without forcing every constructor to be generic over `EventSink`.
pub type SharedSink = Arc<dyn EventSink>;
