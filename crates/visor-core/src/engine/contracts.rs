//! Post-execution contract enforcement: `guarantee` expressions, output
//! schema validation and `fail_if` / `failure_conditions`. Violations
//! become typed `contract/*` issues; they never throw.

use serde_json::Value;

use visor_types::{Issue, SchemaSpec, Severity, StepConfig};

use crate::routing::{self, RoutingContext};

pub const RULE_GUARANTEE: &str = "contract/guarantee_failed";
pub const RULE_SCHEMA: &str = "contract/schema_violation";
pub const RULE_FAIL_IF: &str = "contract/fail_if";
pub const RULE_BUDGET: &str = "contract/budget_exceeded";

/// Outcome of the contract pass over a completed step.
#[derive(Debug, Default)]
pub struct ContractReport {
    pub issues: Vec<Issue>,
    /// True when `fail_if` / `failure_conditions` marked the step failed.
    pub failed: bool,
}

/// Run every post-contract for `step` against its result context.
pub fn enforce(step: &StepConfig, ctx: &RoutingContext) -> ContractReport {
    let mut report = ContractReport::default();

    match routing::violated_guarantees(step, ctx) {
        Ok(violated) => {
            for expression in violated {
                report.issues.push(Issue::new(
                    RULE_GUARANTEE,
                    Severity::Error,
                    format!("guarantee not satisfied: {expression}"),
                ));
            }
        }
        Err(err) => report.issues.push(Issue::new(
            RULE_GUARANTEE,
            Severity::Error,
            format!("guarantee evaluation failed: {err}"),
        )),
    }

    if let Some(schema) = output_schema(step) {
        if let Some(message) = validate_schema(&schema, &ctx.output) {
            report
                .issues
                .push(Issue::new(RULE_SCHEMA, Severity::Error, message));
        }
    }

    match routing::failure_condition(step, ctx) {
        Ok(Some(expression)) => {
            report.failed = true;
            report.issues.push(Issue::new(
                RULE_FAIL_IF,
                Severity::Error,
                format!("failure condition held: {expression}"),
            ));
        }
        Ok(None) => {}
        Err(err) => {
            // An erroring failure condition fails the step conservatively.
            report.failed = true;
            report.issues.push(Issue::new(
                RULE_FAIL_IF,
                Severity::Error,
                format!("failure condition evaluation failed: {err}"),
            ));
        }
    }

    report
}

/// The inline JSON-Schema for the step's output, if any. A string-valued
/// `schema` is a renderer tag and selects an output renderer downstream;
/// it never validates here.
fn output_schema(step: &StepConfig) -> Option<Value> {
    if let Some(SchemaSpec::Inline(schema)) = &step.schema {
        return Some(schema.clone());
    }
    step.output_schema.clone()
}

fn validate_schema(schema: &Value, output: &Value) -> Option<String> {
    let compiled = match jsonschema::validator_for(schema) {
        Ok(compiled) => compiled,
        Err(err) => return Some(format!("output schema does not compile: {err}")),
    };
    let mut messages: Vec<String> = compiled
        .iter_errors(output)
        .map(|error| format!("{} at {}", error, error.instance_path))
        .collect();
    if messages.is_empty() {
        return None;
    }
    messages.truncate(5);
    Some(format!("output violates schema: {}", messages.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(yaml: &str) -> StepConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn ctx(output: Value) -> RoutingContext {
        RoutingContext {
            output,
            ..RoutingContext::default()
        }
    }

    #[test]
    fn guarantee_violation_is_an_issue_not_a_throw() {
        let step = step("type: noop\nguarantee: \"output.count > 0\"");
        let report = enforce(&step, &ctx(json!({"count": 0})));
        assert!(!report.failed);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].rule_id, RULE_GUARANTEE);
    }

    #[test]
    fn inline_schema_validates_output() {
        let step = step(
            "type: noop\nschema:\n  type: object\n  required: [count]\n  properties:\n    count:\n      type: integer",
        );
        let ok = enforce(&step, &ctx(json!({"count": 3})));
        assert!(ok.issues.is_empty());
        let bad = enforce(&step, &ctx(json!({"count": "three"})));
        assert_eq!(bad.issues.len(), 1);
        assert_eq!(bad.issues[0].rule_id, RULE_SCHEMA);
    }

    #[test]
    fn renderer_tag_schema_never_validates() {
        let step = step("type: noop\nschema: markdown");
        let report = enforce(&step, &ctx(json!("free text")));
        assert!(report.issues.is_empty());
    }

    #[test]
    fn fail_if_marks_failure_without_throwing() {
        let step = step("type: noop\nfail_if: \"output.status == 'bad'\"");
        let report = enforce(&step, &ctx(json!({"status": "bad"})));
        assert!(report.failed);
        assert_eq!(report.issues[0].rule_id, RULE_FAIL_IF);
    }

    #[test]
    fn erroring_fail_if_fails_conservatively() {
        let step = step("type: noop\nfail_if: \"1 +\"");
        let report = enforce(&step, &ctx(json!({})));
        assert!(report.failed);
    }
}
