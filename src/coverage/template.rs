//! [`TestTemplateGenerator`]: emits a scaffolded pgTAP template for an
//! uncovered [`TestRequirement`] (spec.md §4.7).

use serde::{Deserialize, Serialize};

use crate::coverage::requirement::{RequirementKind, TestRequirement};

/// The rendered template plus the generator's own verdict on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedTemplate {
    pub requirement_name: String,
    pub sql: String,
    /// True when the enriched, requirement-specific template failed
    /// self-validation and the basic fallback was used instead.
    pub fallback_used: bool,
    /// Why the enriched template was rejected, when `fallback_used` is
    /// true. Never surfaced as an error (spec.md §4.7: "never throw").
    pub fallback_reason: Option<String>,
}

/// Generates and self-validates a template for `requirement`. Never
/// fails: an enrichment failure degrades to the basic template with the
/// failure recorded as metadata rather than propagated.
pub fn generate(requirement: &TestRequirement) -> GeneratedTemplate {
    let enriched = enriched_template(requirement);
    match validate(&enriched) {
        Ok(()) => GeneratedTemplate {
            requirement_name: requirement.name.clone(),
            sql: enriched,
            fallback_used: false,
            fallback_reason: None,
        },
        Err(reason) => {
            let basic = basic_template(requirement);
            GeneratedTemplate {
                requirement_name: requirement.name.clone(),
                sql: basic,
                fallback_used: true,
                fallback_reason: Some(reason),
            }
        }
    }
}

fn plan_header(count: usize) -> String {
    format!("BEGIN;\nSELECT plan({count});\n\n")
}

const FOOTER: &str = "\nSELECT * FROM finish();\nROLLBACK;\n";

/// The richer, requirement-specific body: more than one assertion,
/// tailored to the requirement kind and any metadata it carries.
fn enriched_template(requirement: &TestRequirement) -> String {
    let TestRequirement {
        kind, name, schema, ..
    } = requirement;

    match kind {
        RequirementKind::Table => format!(
            "{header}SELECT has_table('{schema}', '{name}', 'table {name} should exist');\nSELECT has_pk('{schema}', '{name}', 'table {name} should have a primary key');\n{FOOTER}",
            header = plan_header(2),
        ),
        RequirementKind::Column => {
            let (table, column) = split_dotted(name);
            format!(
                "{header}SELECT has_column('{schema}', '{table}', '{column}', 'column {table}.{column} should exist');\nSELECT col_not_null('{schema}', '{table}', '{column}', 'column {table}.{column} nullability should be intentional');\n{FOOTER}",
                header = plan_header(2),
            )
        }
        RequirementKind::Function => format!(
            "{header}SELECT has_function('{schema}', '{name}', 'function {name} should exist');\nSELECT function_lang_is('{schema}', '{name}', 'plpgsql', 'function {name} language should be declared');\n{FOOTER}",
            header = plan_header(2),
        ),
        RequirementKind::Rpc => format!(
            "{header}SELECT has_function('{schema}', '{name}', 'rpc {name} should exist');\nSELECT function_privs_are('{schema}', '{name}', ARRAY[]::text[], 'authenticated', 'rpc {name} privileges should be explicit');\n{FOOTER}",
            header = plan_header(2),
        ),
        RequirementKind::Index => {
            let (table, index) = split_dotted(name);
            format!(
                "{header}SELECT has_index('{schema}', '{table}', '{index}', 'index {index} should exist on {table}');\n{FOOTER}",
                header = plan_header(1),
            )
        }
        RequirementKind::Trigger => {
            let (table, trigger) = split_dotted(name);
            format!(
                "{header}SELECT has_trigger('{schema}', '{table}', '{trigger}', 'trigger {trigger} should exist on {table}');\nSELECT trigger_is('{schema}', '{table}', '{trigger}', '{schema}', 'unspecified_function', 'trigger {trigger} should call its declared function');\n{FOOTER}",
                header = plan_header(2),
            )
        }
        RequirementKind::Rls => format!(
            "{header}SELECT is_rls_enabled('{schema}', '{name}', 'row level security should be enabled on {name}');\nSELECT policy_exists('{schema}', '{name}', 'at least one policy should exist on {name}');\n{FOOTER}",
            header = plan_header(2),
        ),
        RequirementKind::Constraint => format!(
            "{header}SELECT has_table('{schema}', '{name}', 'table {name} should exist for its check constraint');\n-- TODO: pgTAP has no has_check_constraint(); assert the constraint's\n-- effect directly, e.g. `SELECT throws_ok($$INSERT ...$$)`.\n{FOOTER}",
            header = plan_header(1),
        ),
    }
}

/// A minimal, always-valid fallback: a single assertion that is
/// guaranteed to exist for any requirement kind.
fn basic_template(requirement: &TestRequirement) -> String {
    let schema = &requirement.schema;
    let name = first_component(&requirement.name);
    format!(
        "{header}SELECT has_table('{schema}', '{name}', 'placeholder coverage for {name}');\n{FOOTER}",
        header = plan_header(1),
    )
}

fn split_dotted(name: &str) -> (String, String) {
    match name.split_once('.') {
        Some((a, b)) => (a.to_string(), b.to_string()),
        None => (name.to_string(), name.to_string()),
    }
}

fn first_component(name: &str) -> String {
    name.split('.').next().unwrap_or(name).to_string()
}

/// The self-check spec.md §4.7 requires: reject a template missing a
/// plan declaration, missing any real pgTAP assertion call, or
/// containing a classic SQL-injection shape in a substituted value.
fn validate(sql: &str) -> Result<(), String> {
    if !sql.contains("plan(") {
        return Err("template is missing a plan() declaration".to_string());
    }
    let has_assertion = crate::coverage::assertion::AssertionKind::ALL
        .iter()
        .any(|kind| sql.contains(&format!("{}(", kind.as_str())));
    if !has_assertion {
        return Err("template contains no recognizable pgTAP assertion call".to_string());
    }
    if looks_like_sql_injection(sql) {
        return Err("template body contains a suspicious SQL-injection-shaped substitution".to_string());
    }
    Ok(())
}

/// Recognizes the textbook injection shapes (`' OR '1'='1`, a stacked
/// `; DROP ...`, an unterminated comment `--` mid-literal) inside a
/// single-quoted literal. This is defense-in-depth, not a SQL parser:
/// every value we substitute comes from our own identifier parsing, but
/// a future caller-supplied requirement name should not silently make it
/// into executable SQL.
fn looks_like_sql_injection(sql: &str) -> bool {
    let lower = sql.to_ascii_lowercase();
    lower.contains("' or '1'='1")
        || lower.contains("';--")
        || lower.contains("'; drop ")
        || lower.contains("' or 1=1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::database::GapPriority;
    use serde_json::Value;

    fn requirement(kind: RequirementKind, name: &str) -> TestRequirement {
        TestRequirement {
            kind,
            name: name.to_string(),
            schema: "public".to_string(),
            priority: GapPriority::High,
            metadata: Value::Null,
        }
    }

    #[test]
    fn table_requirement_produces_valid_template() {
        let generated = generate(&requirement(RequirementKind::Table, "users"));
        assert!(!generated.fallback_used);
        assert!(generated.sql.contains("SELECT plan(2)"));
        assert!(generated.sql.contains("has_table"));
        assert!(generated.sql.trim_end().ends_with("ROLLBACK;"));
    }

    #[test]
    fn column_requirement_splits_dotted_name() {
        let generated = generate(&requirement(RequirementKind::Column, "users.email"));
        assert!(generated.sql.contains("has_column('public', 'users', 'email'"));
    }

    #[test]
    fn rls_requirement_asserts_enabled_and_policy() {
        let generated = generate(&requirement(RequirementKind::Rls, "users"));
        assert!(generated.sql.contains("is_rls_enabled"));
        assert!(generated.sql.contains("policy_exists"));
    }

    #[test]
    fn constraint_requirement_carries_a_concrete_todo() {
        let generated = generate(&requirement(RequirementKind::Constraint, "users"));
        assert!(generated.sql.contains("TODO"));
        assert!(generated.sql.contains("has_table"));
    }

    #[test]
    fn every_kind_passes_self_validation_without_fallback() {
        for kind in [
            RequirementKind::Table,
            RequirementKind::Column,
            RequirementKind::Function,
            RequirementKind::Rpc,
            RequirementKind::Index,
            RequirementKind::Trigger,
            RequirementKind::Rls,
            RequirementKind::Constraint,
        ] {
            let generated = generate(&requirement(kind, "users.thing"));
            assert!(!generated.fallback_used, "{kind:?} required a fallback");
        }
    }

    #[test]
    fn validate_rejects_missing_plan() {
        let err = validate("SELECT has_table('public', 'x');\n").unwrap_err();
        assert!(err.contains("plan"));
    }

    #[test]
    fn validate_rejects_missing_assertion() {
        let err = validate("SELECT plan(1);\nSELECT 1;\n").unwrap_err();
        assert!(err.contains("assertion"));
    }

    #[test]
    fn validate_rejects_injection_shaped_literal() {
        let err = validate("SELECT plan(1);\nSELECT has_table('public', 'x' OR '1'='1');\n")
            .unwrap_err();
        assert!(err.contains("injection"));
    }

    #[test]
    fn basic_fallback_is_itself_valid() {
        let req = requirement(RequirementKind::Table, "users");
        let basic = basic_template(&req);
        assert!(validate(&basic).is_ok());
    }
}
