//! Explicit configuration structs for every component: constructors take a
//! config struct rather than a long argument list. Each struct has a
//! `Default` impl so a partial TOML/JSON document deserializes with sane
//! defaults.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Configuration for [`crate::git::GitDeploymentTracker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitTrackerConfig {
    /// Working copy root. Defaults to the current directory.
    pub repo_root: PathBuf,
    /// Directory (relative to `repo_root`) that holds the golden SQL
    /// tree, used by `getSQLAtCommit`.
    pub sql_dir: PathBuf,
    /// Prefix for deployment tags, before the user-supplied name is
    /// appended (`data-deploy-*`).
    pub tag_prefix: String,
    /// Timeout for `git` subprocess invocations.
    pub git_timeout_secs: u64,
}

impl Default for GitTrackerConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            sql_dir: PathBuf::from("sql"),
            tag_prefix: "data-deploy-".to_string(),
            git_timeout_secs: 30,
        }
    }
}

/// Configuration for [`crate::coverage::scanner::PgTapTestScanner`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Root directory to walk for `.sql` test files.
    pub tests_dir: PathBuf,
    /// Maximum recursion depth.
    pub max_depth: usize,
    /// Glob patterns that must match for a file to be scanned. Empty
    /// means "match everything not excluded".
    pub include: Vec<String>,
    /// Glob patterns that exclude an otherwise-matching file.
    pub exclude: Vec<String>,
    /// Follow symlinks while walking. Broken symlinks always warn and
    /// are skipped, regardless of this flag.
    pub follow_symlinks: bool,
    /// Scan dotfiles (`.foo.sql`) instead of skipping them by default.
    pub include_hidden: bool,
    /// Treat `--` line comments as live SQL instead of stripping them.
    pub include_commented: bool,
    /// Emit a warning when a file's declared `plan()` count disagrees
    /// with its observed assertion count.
    pub validate_plans: bool,
    /// Files processed per batch before yielding to the event loop.
    pub batch_size: usize,
    /// Soft ceiling in megabytes before the scanner switches to
    /// streaming mode. Accepts a bare number or a human-written string
    /// such as `"512mb"` when deserialized from a config file.
    #[serde(deserialize_with = "mb_value")]
    pub memory_ceiling_mb: u64,
    /// Hard per-object-type cap once streaming mode is active.
    pub max_objects_per_type: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            tests_dir: PathBuf::from("tests"),
            max_depth: 10,
            include: Vec::new(),
            exclude: Vec::new(),
            follow_symlinks: false,
            include_hidden: false,
            include_commented: false,
            validate_plans: true,
            batch_size: 100,
            memory_ceiling_mb: 512,
            max_objects_per_type: 10_000,
        }
    }
}

/// The policy level that maps a gap set to a block/allow decision.
/// Deserializes from a bare string
/// (`"strict"`/`"normal"`/`"lenient"`) for ergonomic config files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    /// Block if any gap exists, regardless of priority. Default in
    /// production.
    #[default]
    Strict,
    /// Block if any `critical` or `high` gap exists.
    Normal,
    /// Block only if any `critical` gap exists.
    Lenient,
}

/// Configuration for [`crate::coverage::enforcer::CoverageEnforcer`] and
/// [`crate::coverage::orchestrator::TestCoverageOrchestrator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub level: EnforcementLevel,
    /// Whether a caller-supplied `bypass_reason` is honored at all.
    pub allow_bypass: bool,
    /// Generate pgTAP templates for every gap found.
    pub generate_templates: bool,
    /// True when running against a production target; governs the
    /// technical-failure policy (fail closed in production, warn-and-continue
    /// otherwise).
    pub is_production: bool,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            level: EnforcementLevel::Strict,
            allow_bypass: false,
            generate_templates: true,
            is_production: true,
        }
    }
}

/// Configuration for [`crate::migration::compiler::MigrationCompiler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub sql_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            sql_dir: PathBuf::from("sql"),
            output_dir: PathBuf::from("migrations"),
        }
    }
}

/// Configuration for [`crate::migration::diff_engine::DiffEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffEngineConfig {
    pub sql_dir: PathBuf,
    pub include_drop_statements: bool,
}

impl Default for DiffEngineConfig {
    fn default() -> Self {
        Self {
            sql_dir: PathBuf::from("sql"),
            include_drop_statements: true,
        }
    }
}

/// Top-level configuration for [`crate::orchestrator::Orchestrator`].
/// This is the single constructor argument the orchestrator needs beyond
/// its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub git: GitTrackerConfig,
    pub scanner: ScannerConfig,
    pub enforcement: EnforcementConfig,
    pub compiler: CompilerConfig,
    pub diff_engine: DiffEngineConfig,
    /// Directory that, if present and nonempty, triggers the `functions`
    /// phase.
    pub functions_dir: Option<PathBuf>,
    pub skip_tests: bool,
    pub skip_coverage: bool,
    pub skip_functions: bool,
    /// Thread a dry run through every phase instead of treating it as
    /// confirmation-only: no `git`, SQL, or subprocess side effect commits.
    pub dry_run: bool,
    pub test_command: Option<Vec<String>>,
    pub test_timeout_secs: u64,
    pub function_deploy_timeout_secs: u64,
    pub environment: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            git: GitTrackerConfig::default(),
            scanner: ScannerConfig::default(),
            enforcement: EnforcementConfig::default(),
            compiler: CompilerConfig::default(),
            diff_engine: DiffEngineConfig::default(),
            functions_dir: None,
            skip_tests: false,
            skip_coverage: false,
            skip_functions: false,
            dry_run: false,
            test_command: None,
            test_timeout_secs: 300,
            function_deploy_timeout_secs: 120,
            environment: "production".to_string(),
        }
    }
}

/// Accepts either a bare number of megabytes or a human-written string
/// like `"512"` or `"512mb"` for [`ScannerConfig::memory_ceiling_mb`], so a
/// hand-edited config file doesn't have to know the field is numeric.
fn mb_value<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrU64 {
        String(String),
        U64(u64),
    }

    match StringOrU64::deserialize(deserializer)? {
        StringOrU64::U64(v) => Ok(v),
        StringOrU64::String(v) => {
            let digits: String = v.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("not a valid memory size: {v:?}")))
        }
    }
}
