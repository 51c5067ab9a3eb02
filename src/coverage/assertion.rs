//! The closed catalog of pgTAP assertion kinds and the hand-written call
//! parser that replaces a one-regex-per-kind catalog: a small parser that
//! consumes `identifier(arg, arg, ...)` plus an assertion-kind registry
//! avoids the `(schema, table, description)` vs `(table, description)`
//! ambiguity that string-length heuristics alone cannot resolve cleanly.

use serde::{Deserialize, Serialize};

/// The seven object categories a [`crate::coverage::database::CoverageDatabase`]
/// indexes by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObjectCategory {
    Schemas,
    Tables,
    Columns,
    Functions,
    Policies,
    Indexes,
    Triggers,
}

/// How many schema-qualified identifier components an assertion call
/// names, used to disambiguate `(schema, object, ...)` from
/// `(object, ...)` shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierArity {
    /// No named object (e.g. `results_eq` compares two queries).
    None,
    /// Exactly one object identifier: a table, function, view, type, or
    /// schema name.
    Single,
    /// Two identifier components: a parent object and a named child
    /// (table.column, table.index, table.trigger).
    Pair,
}

/// The closed catalog of recognized pgTAP assertion kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    HasSchema,
    HasntSchema,
    HasTable,
    HasntTable,
    TablePrivsAre,
    TableOwnerIs,
    TablesAre,
    HasColumn,
    HasntColumn,
    ColTypeIs,
    ColNotNull,
    ColIsNull,
    ColHasDefault,
    ColHasntDefault,
    ColDefaultIs,
    ColIsPk,
    ColIsntPk,
    HasPk,
    HasntPk,
    HasFk,
    HasntFk,
    HasIndex,
    HasntIndex,
    IndexIsOn,
    IndexIsType,
    HasUnique,
    HasntUnique,
    IndexIsPrimary,
    HasFunction,
    HasntFunction,
    FunctionReturns,
    FunctionLangIs,
    IsDefiner,
    IsntDefiner,
    VolatilityIs,
    FunctionPrivsAre,
    HasView,
    HasntView,
    HasType,
    HasntType,
    ResultsEq,
    ResultsNe,
    IsRlsEnabled,
    PolicyExists,
    PolicyCmdIs,
    PolicyRolesAre,
    PoliciesAre,
    HasTrigger,
    HasntTrigger,
    TriggerIs,
    IsTriggerOn,
    TriggerFiresOn,
    TriggerIsFor,
    TriggersAre,
}

impl AssertionKind {
    /// The full closed catalog, used by the scanner to know every call
    /// name it must look for.
    pub const ALL: &'static [AssertionKind] = &[
        AssertionKind::HasSchema,
        AssertionKind::HasntSchema,
        AssertionKind::HasTable,
        AssertionKind::HasntTable,
        AssertionKind::TablePrivsAre,
        AssertionKind::TableOwnerIs,
        AssertionKind::TablesAre,
        AssertionKind::HasColumn,
        AssertionKind::HasntColumn,
        AssertionKind::ColTypeIs,
        AssertionKind::ColNotNull,
        AssertionKind::ColIsNull,
        AssertionKind::ColHasDefault,
        AssertionKind::ColHasntDefault,
        AssertionKind::ColDefaultIs,
        AssertionKind::ColIsPk,
        AssertionKind::ColIsntPk,
        AssertionKind::HasPk,
        AssertionKind::HasntPk,
        AssertionKind::HasFk,
        AssertionKind::HasntFk,
        AssertionKind::HasIndex,
        AssertionKind::HasntIndex,
        AssertionKind::IndexIsOn,
        AssertionKind::IndexIsType,
        AssertionKind::HasUnique,
        AssertionKind::HasntUnique,
        AssertionKind::IndexIsPrimary,
        AssertionKind::HasFunction,
        AssertionKind::HasntFunction,
        AssertionKind::FunctionReturns,
        AssertionKind::FunctionLangIs,
        AssertionKind::IsDefiner,
        AssertionKind::IsntDefiner,
        AssertionKind::VolatilityIs,
        AssertionKind::FunctionPrivsAre,
        AssertionKind::HasView,
        AssertionKind::HasntView,
        AssertionKind::HasType,
        AssertionKind::HasntType,
        AssertionKind::ResultsEq,
        AssertionKind::ResultsNe,
        AssertionKind::IsRlsEnabled,
        AssertionKind::PolicyExists,
        AssertionKind::PolicyCmdIs,
        AssertionKind::PolicyRolesAre,
        AssertionKind::PoliciesAre,
        AssertionKind::HasTrigger,
        AssertionKind::HasntTrigger,
        AssertionKind::TriggerIs,
        AssertionKind::IsTriggerOn,
        AssertionKind::TriggerFiresOn,
        AssertionKind::TriggerIsFor,
        AssertionKind::TriggersAre,
    ];

    /// The pgTAP SQL function name, e.g. `has_table`.
    pub fn as_str(self) -> &'static str {
        match self {
            AssertionKind::HasSchema => "has_schema",
            AssertionKind::HasntSchema => "hasnt_schema",
            AssertionKind::HasTable => "has_table",
            AssertionKind::HasntTable => "hasnt_table",
            AssertionKind::TablePrivsAre => "table_privs_are",
            AssertionKind::TableOwnerIs => "table_owner_is",
            AssertionKind::TablesAre => "tables_are",
            AssertionKind::HasColumn => "has_column",
            AssertionKind::HasntColumn => "hasnt_column",
            AssertionKind::ColTypeIs => "col_type_is",
            AssertionKind::ColNotNull => "col_not_null",
            AssertionKind::ColIsNull => "col_is_null",
            AssertionKind::ColHasDefault => "col_has_default",
            AssertionKind::ColHasntDefault => "col_hasnt_default",
            AssertionKind::ColDefaultIs => "col_default_is",
            AssertionKind::ColIsPk => "col_is_pk",
            AssertionKind::ColIsntPk => "col_isnt_pk",
            AssertionKind::HasPk => "has_pk",
            AssertionKind::HasntPk => "hasnt_pk",
            AssertionKind::HasFk => "has_fk",
            AssertionKind::HasntFk => "hasnt_fk",
            AssertionKind::HasIndex => "has_index",
            AssertionKind::HasntIndex => "hasnt_index",
            AssertionKind::IndexIsOn => "index_is_on",
            AssertionKind::IndexIsType => "index_is_type",
            AssertionKind::HasUnique => "has_unique",
            AssertionKind::HasntUnique => "hasnt_unique",
            AssertionKind::IndexIsPrimary => "index_is_primary",
            AssertionKind::HasFunction => "has_function",
            AssertionKind::HasntFunction => "hasnt_function",
            AssertionKind::FunctionReturns => "function_returns",
            AssertionKind::FunctionLangIs => "function_lang_is",
            AssertionKind::IsDefiner => "is_definer",
            AssertionKind::IsntDefiner => "isnt_definer",
            AssertionKind::VolatilityIs => "volatility_is",
            AssertionKind::FunctionPrivsAre => "function_privs_are",
            AssertionKind::HasView => "has_view",
            AssertionKind::HasntView => "hasnt_view",
            AssertionKind::HasType => "has_type",
            AssertionKind::HasntType => "hasnt_type",
            AssertionKind::ResultsEq => "results_eq",
            AssertionKind::ResultsNe => "results_ne",
            AssertionKind::IsRlsEnabled => "is_rls_enabled",
            AssertionKind::PolicyExists => "policy_exists",
            AssertionKind::PolicyCmdIs => "policy_cmd_is",
            AssertionKind::PolicyRolesAre => "policy_roles_are",
            AssertionKind::PoliciesAre => "policies_are",
            AssertionKind::HasTrigger => "has_trigger",
            AssertionKind::HasntTrigger => "hasnt_trigger",
            AssertionKind::TriggerIs => "trigger_is",
            AssertionKind::IsTriggerOn => "is_trigger_on",
            AssertionKind::TriggerFiresOn => "trigger_fires_on",
            AssertionKind::TriggerIsFor => "trigger_is_for",
            AssertionKind::TriggersAre => "triggers_are",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }

    /// Which of the seven database categories this assertion kind feeds.
    pub fn category(self) -> ObjectCategory {
        use AssertionKind::*;
        match self {
            HasSchema | HasntSchema | HasType | HasntType => ObjectCategory::Schemas,
            HasTable | HasntTable | TablePrivsAre | TableOwnerIs | TablesAre | HasView
            | HasntView | HasPk | HasntPk | HasFk | HasntFk | ResultsEq | ResultsNe => {
                ObjectCategory::Tables
            }
            HasColumn | HasntColumn | ColTypeIs | ColNotNull | ColIsNull | ColHasDefault
            | ColHasntDefault | ColDefaultIs | ColIsPk | ColIsntPk => ObjectCategory::Columns,
            HasFunction | HasntFunction | FunctionReturns | FunctionLangIs | IsDefiner
            | IsntDefiner | VolatilityIs | FunctionPrivsAre => ObjectCategory::Functions,
            IsRlsEnabled | PolicyExists | PolicyCmdIs | PolicyRolesAre | PoliciesAre => {
                ObjectCategory::Policies
            }
            HasIndex | HasntIndex | IndexIsOn | IndexIsType | HasUnique | HasntUnique
            | IndexIsPrimary => ObjectCategory::Indexes,
            HasTrigger | HasntTrigger | TriggerIs | IsTriggerOn | TriggerFiresOn
            | TriggerIsFor | TriggersAre => ObjectCategory::Triggers,
        }
    }

    /// How many identifier components (beyond an optional leading
    /// schema) this assertion names.
    pub fn arity(self) -> IdentifierArity {
        use AssertionKind::*;
        match self {
            ResultsEq | ResultsNe => IdentifierArity::None,
            HasColumn | HasntColumn | ColTypeIs | ColNotNull | ColIsNull | ColHasDefault
            | ColHasntDefault | ColDefaultIs | ColIsPk | ColIsntPk | HasIndex | HasntIndex
            | IndexIsOn | IndexIsType | HasUnique | HasntUnique | IndexIsPrimary | HasTrigger
            | HasntTrigger | TriggerIs | IsTriggerOn | TriggerFiresOn | TriggerIsFor => {
                IdentifierArity::Pair
            }
            _ => IdentifierArity::Single,
        }
    }
}

/// A single parsed pgTAP assertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestAssertion {
    pub kind: AssertionKind,
    /// Dotted, lowercase, schema-qualified target (default schema `public`).
    pub target: String,
    pub parameters: Vec<String>,
    pub line_number: usize,
    pub raw_sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_metadata: Option<String>,
}

/// A short, space-free token: the heuristic used to decide whether a
/// positional argument is a schema name rather than the object itself or
/// a human description.
pub fn is_schema_like(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 40
        && !token.contains(' ')
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolves `(schema, object, rest)` for a single-identifier assertion: if
/// the second argument is schema-shaped, the first argument was the
/// schema; otherwise the first argument is the object and everything
/// after it is description/params.
pub fn resolve_single(args: &[String]) -> (String, String, Vec<String>) {
    if args.is_empty() {
        return ("public".to_string(), String::new(), Vec::new());
    }
    if args.len() >= 2 && is_schema_like(&args[1]) {
        // A short, space-free second argument can only be a schema name,
        // not a description: `has_table('public', 'users')` is
        // schema-qualified, while `has_table('users', 'a description')`
        // is distinguished by `args[1]` failing `is_schema_like`.
        (args[0].clone(), args[1].clone(), args[2..].to_vec())
    } else {
        ("public".to_string(), args[0].clone(), args[1..].to_vec())
    }
}

/// Resolves `(schema, parent, child, rest)` for a two-identifier
/// assertion (e.g. `has_column`, `has_index`, `has_trigger`).
pub fn resolve_pair(args: &[String]) -> (String, String, String, Vec<String>) {
    if args.len() >= 3 && is_schema_like(&args[0]) && is_schema_like(&args[1]) {
        (
            args[0].clone(),
            args[1].clone(),
            args[2].clone(),
            args[3..].to_vec(),
        )
    } else if args.len() >= 2 {
        (
            "public".to_string(),
            args[0].clone(),
            args[1].clone(),
            args[2..].to_vec(),
        )
    } else if args.len() == 1 {
        (
            "public".to_string(),
            args[0].clone(),
            String::new(),
            Vec::new(),
        )
    } else {
        ("public".to_string(), String::new(), String::new(), Vec::new())
    }
}

/// Normalizes a target path to lowercase, joined with `.`, escaping a
/// literal `::` inside any component.
pub fn normalize_target(schema: &str, components: &[&str]) -> String {
    let schema = if schema.is_empty() { "public" } else { schema };
    let mut parts = vec![escape_component(schema)];
    for component in components {
        if !component.is_empty() {
            parts.push(escape_component(component));
        }
    }
    parts.join(".").to_lowercase()
}

fn escape_component(component: &str) -> String {
    component.replace("::", "\\:\\:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_round_trips_every_name() {
        for kind in AssertionKind::ALL {
            assert_eq!(AssertionKind::from_str(kind.as_str()), Some(*kind));
        }
    }

    #[test]
    fn schema_like_rejects_sentences() {
        assert!(is_schema_like("users"));
        assert!(!is_schema_like("a description with spaces"));
        assert!(!is_schema_like(""));
    }

    #[test]
    fn resolve_single_defaults_schema_to_public() {
        let args = vec!["users".to_string(), "a long description here".to_string()];
        let (schema, object, rest) = resolve_single(&args);
        assert_eq!(schema, "public");
        assert_eq!(object, "users");
        assert_eq!(rest, vec!["a long description here".to_string()]);
    }

    #[test]
    fn resolve_single_picks_up_explicit_schema() {
        let args = vec![
            "app".to_string(),
            "users".to_string(),
            "description".to_string(),
        ];
        let (schema, object, _) = resolve_single(&args);
        assert_eq!(schema, "app");
        assert_eq!(object, "users");
    }

    #[test]
    fn resolve_pair_defaults_schema_and_reads_table_column() {
        let args = vec!["users".to_string(), "id".to_string()];
        let (schema, table, column, _) = resolve_pair(&args);
        assert_eq!(schema, "public");
        assert_eq!(table, "users");
        assert_eq!(column, "id");
    }

    #[test]
    fn normalize_target_lowercases_and_escapes_separator() {
        let target = normalize_target("Public", &["Users", "Weird::Col"]);
        assert_eq!(target, "public.users.weird\\:\\:col");
    }

    #[quickcheck_macros::quickcheck]
    fn normalize_target_output_is_always_lowercase(schema: String, a: String, b: String) -> bool {
        let result = normalize_target(&schema, &[&a, &b]);
        result == result.to_lowercase()
    }

    #[quickcheck_macros::quickcheck]
    fn normalize_target_empty_schema_defaults_to_public(a: String) -> quickcheck::TestResult {
        if a.is_empty() {
            return quickcheck::TestResult::discard();
        }
        quickcheck::TestResult::from_bool(normalize_target("", &[&a]).starts_with("public."))
    }
}
