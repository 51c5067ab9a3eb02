//! Test coverage subsystem: discovers pgTAP assertions, derives what a
//! migration batch requires, and enforces the gap between them.

pub mod assertion;
pub mod database;
pub mod enforcer;
pub mod orchestrator;
pub mod requirement;
pub mod scanner;
pub mod template;

pub use assertion::{AssertionKind, IdentifierArity, ObjectCategory, TestAssertion};
pub use database::{CoverageDatabase, CoverageEntry, CoverageGap, GapPriority};
pub use enforcer::{CoverageEnforcer, EnforcementResult};
pub use orchestrator::{CheckCoverageOptions, CoverageSnapshot, CoverageTrend, TestCoverageOrchestrator};
pub use requirement::{RequirementKind, RequirementSummary, TestRequirement};
pub use scanner::{PgTapTestScanner, ScanOutcome, TestFile};
pub use template::GeneratedTemplate;
