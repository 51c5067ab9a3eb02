//! The migration generator: a compiler that concatenates golden SQL into
//! one artifact, and a diff engine that derives incremental migrations
//! between two Git refs.

pub mod compiler;
pub mod diff_engine;
pub mod operation;

pub use compiler::{CompiledArtifact, MigrationCompiler};
pub use diff_engine::{DiffBuckets, DiffEngine, DiffItem};
pub use operation::{MigrationOperation, OperationBatch, OperationKind, validate_operations};
