//! [`TestCoverageOrchestrator`]: composes the scanner, requirement
//! analyzer, enforcer, and template generator into the single
//! `check_coverage` entry point (spec.md §4.9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EnforcementConfig;
use crate::coverage::database::CoverageDatabase;
use crate::coverage::enforcer::{CoverageEnforcer, EnforcementResult};
use crate::coverage::requirement;
use crate::coverage::scanner::PgTapTestScanner;
use crate::coverage::template;
use crate::errors::DeployError;
use crate::events::{DeployEvent, EventSink, SharedSink};
use crate::migration::operation::MigrationOperation;

const COMPONENT: &str = "TestCoverageOrchestrator";

/// Options for a single [`TestCoverageOrchestrator::check_coverage`] call.
#[derive(Debug, Clone, Default)]
pub struct CheckCoverageOptions {
    pub bypass_reason: Option<String>,
}

pub struct TestCoverageOrchestrator {
    scanner: PgTapTestScanner,
    enforcement: EnforcementConfig,
    sink: SharedSink,
}

impl TestCoverageOrchestrator {
    pub fn new(scanner: PgTapTestScanner, enforcement: EnforcementConfig, sink: SharedSink) -> Self {
        Self {
            scanner,
            enforcement,
            sink,
        }
    }

    /// Runs the five phases spec.md §4.9 describes: analyze, scan,
    /// enforce, (optionally) generate templates for gaps, assemble.
    ///
    /// A tests directory that exists but holds no matching files
    /// downgrades to "no coverage" rather than an error, so a fresh
    /// project surfaces gaps instead of crashing. A tests directory that
    /// does not exist at all is a technical failure (spec.md §8 S3): it
    /// goes through [`CoverageEnforcer::handle_technical_failure`]'s
    /// fail-closed/bypass-required policy rather than being silently
    /// treated as zero coverage.
    pub fn check_coverage(
        &self,
        operations: &[MigrationOperation],
        options: &CheckCoverageOptions,
    ) -> Result<EnforcementResult, DeployError> {
        self.sink.emit(DeployEvent::Start {
            component: COMPONENT.to_string(),
            message: format!("checking coverage for {} operation(s)", operations.len()),
        });

        let (requirements, _summary) = requirement::analyze(operations)?;

        let enforcer = CoverageEnforcer::new(
            self.enforcement.level,
            self.enforcement.allow_bypass,
            self.enforcement.is_production,
        );

        let database = match self.scanner.scan() {
            Ok(outcome) if outcome.streaming => {
                self.sink.emit(DeployEvent::Warning {
                    component: COMPONENT.to_string(),
                    message: "memory ceiling crossed, building coverage database in streaming mode".to_string(),
                });
                CoverageDatabase::from_test_files_capped(
                    &outcome.files,
                    self.scanner.max_objects_per_type(),
                    self.sink.as_ref(),
                )
            }
            Ok(outcome) => CoverageDatabase::from_test_files(&outcome.files),
            Err(err) => {
                let message = err.to_string();
                self.sink.emit(DeployEvent::Warning {
                    component: COMPONENT.to_string(),
                    message: format!("scan failed, treating as a technical failure: {message}"),
                });
                let result = enforcer
                    .handle_technical_failure(&message, options.bypass_reason.as_deref())?;
                self.emit_result(&result);
                return Ok(result);
            }
        };

        let mut result = enforcer.enforce(&requirements, &database, options.bypass_reason.as_deref());

        if self.enforcement.generate_templates && !result.gaps.is_empty() {
            result.templates = requirements
                .iter()
                .filter(|r| result.gaps.iter().any(|g| g.target == normalized(r)))
                .map(template::generate)
                .collect();
        }

        self.emit_result(&result);
        Ok(result)
    }

    fn emit_result(&self, result: &EnforcementResult) {
        if result.should_block {
            self.sink.emit(DeployEvent::EnforcementFailed {
                coverage_percentage: result.coverage_percentage,
                gaps: result.gaps.clone(),
            });
        } else if result.bypass_reason.is_some() {
            self.sink.emit(DeployEvent::EnforcementBypassed {
                reason: result.bypass_reason.clone().unwrap_or_default(),
            });
        } else {
            self.sink.emit(DeployEvent::Success {
                component: COMPONENT.to_string(),
                message: format!("{}% covered, {} gap(s)", result.coverage_percentage, result.gaps.len()),
            });
        }
    }
}

fn normalized(requirement: &crate::coverage::requirement::TestRequirement) -> String {
    let schema = if requirement.schema.is_empty() {
        "public"
    } else {
        &requirement.schema
    };
    crate::coverage::assertion::normalize_target(
        schema,
        &requirement.name.split('.').collect::<Vec<_>>(),
    )
}

/// A point-in-time coverage measurement, persisted by the caller between
/// runs so trend comparisons survive a process restart (SPEC_FULL.md §3;
/// persistence itself is out of scope here, matching the "we do not own
/// secrets/persistence" framing in spec.md §1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub coverage_percentage: u8,
    pub gap_count: usize,
}

/// The delta between two snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CoverageTrend {
    pub percentage_delta: i16,
    pub gap_count_delta: i64,
}

impl CoverageSnapshot {
    pub fn from_result(result: &EnforcementResult, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            coverage_percentage: result.coverage_percentage,
            gap_count: result.gaps.len(),
        }
    }

    /// Pure function over two snapshots; never touches disk (SPEC_FULL.md
    /// §3 leaves persistence to the caller).
    pub fn compare_to(&self, previous: &CoverageSnapshot) -> CoverageTrend {
        CoverageTrend {
            percentage_delta: self.coverage_percentage as i16 - previous.coverage_percentage as i16,
            gap_count_delta: self.gap_count as i64 - previous.gap_count as i64,
        }
    }
}
