//! Two-stage validation: the embedded JSON-Schema catches structural
//! mistakes, then semantic rules enforce the cross-field invariants the
//! schema cannot express. Unknown top-level keys are warnings, not errors,
//! with a small silent allowlist for collaborator surfaces.

use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;

use visor_types::{GotoField, ReuseSession, SchemaSpec, StepType, TransitionBlock, VisorConfig};

use crate::ConfigError;

const EMBEDDED_SCHEMA: &str = include_str!("../schema/visor.schema.json");

/// Keys the core understands plus collaborator surfaces that load through
/// other components. Anything else draws a warning.
const KNOWN_KEYS: &[&str] = &[
    "version",
    "extends",
    "include",
    "output",
    "max_parallelism",
    "fail_fast",
    "fail_if",
    "tag_filter",
    "routing",
    "limits",
    "scheduler",
    "env",
    "steps",
    "checks",
    "frontends",
    "imports",
    "memory",
    "http_server",
    "ai_mcp_servers",
    "policy",
    "sandboxes",
];

/// Keys that are silently ignored without even a warning.
fn silently_allowed(key: &str) -> bool {
    key == "$schema" || key == "metadata" || key.starts_with("x-")
}

/// Schema-validate the normalized document. Returns unknown-key warnings;
/// structural violations are terminal.
pub fn validate_document(document: &YamlValue) -> Result<Vec<String>, ConfigError> {
    let json: JsonValue = serde_yaml::from_value(document.clone()).map_err(|err| {
        ConfigError::Invalid(vec![format!(
            "configuration cannot be represented as JSON: {err}"
        )])
    })?;

    let schema: JsonValue = serde_json::from_str(EMBEDDED_SCHEMA)
        .map_err(|err| ConfigError::Invalid(vec![format!("embedded schema is broken: {err}")]))?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| ConfigError::Invalid(vec![format!("embedded schema is broken: {err}")]))?;

    let errors: Vec<String> = validator
        .iter_errors(&json)
        .map(|error| format!("{} at {}", error, error.instance_path))
        .collect();
    if !errors.is_empty() {
        return Err(ConfigError::Invalid(errors));
    }

    let mut warnings = Vec::new();
    if let JsonValue::Object(map) = &json {
        for key in map.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) && !silently_allowed(key) {
                warnings.push(format!("unknown top-level key '{key}' is ignored"));
            }
        }
    }
    Ok(warnings)
}

/// Cross-field rules from the data model. Violations are terminal;
/// softer findings come back as warnings.
pub fn validate_semantics(config: &VisorConfig) -> Result<Vec<String>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let known: Vec<&str> = config.steps.iter().map(|s| s.name.as_str()).collect();

    for step in &config.steps {
        let name = &step.name;

        // Dependency tokens: every OR-token needs at least one real name.
        for token in &step.depends_on {
            let has_real = token
                .split('|')
                .map(str::trim)
                .any(|candidate| known.contains(&candidate));
            if !has_real {
                errors.push(format!(
                    "step '{name}': depends_on '{token}' references no existing step"
                ));
            }
        }

        match &step.reuse_ai_session {
            Some(ReuseSession::Inherit) if step.depends_on.is_empty() => {
                errors.push(format!(
                    "step '{name}': reuse_ai_session: true requires depends_on"
                ));
            }
            Some(ReuseSession::Named(source))
                if source != name && !known.contains(&source.as_str()) =>
            {
                errors.push(format!(
                    "step '{name}': reuse_ai_session references unknown step '{source}'"
                ));
            }
            _ => {}
        }
        if step.session_mode.is_some() && step.reuse_ai_session.is_none() {
            errors.push(format!(
                "step '{name}': session_mode requires reuse_ai_session"
            ));
        }

        if step.on_finish.is_some() && !step.for_each {
            errors.push(format!("step '{name}': on_finish requires forEach: true"));
        }

        if step.criticality.is_some() && step.step_type.is_output_provider() {
            let has_pre = step.if_condition.is_some() || !step.assume.is_empty();
            let has_post = !step.guarantee.is_empty()
                || matches!(step.schema, Some(SchemaSpec::Inline(_)))
                || step.output_schema.is_some();
            if !has_pre || !has_post {
                errors.push(format!(
                    "step '{name}': criticality requires (assume or if) and (schema or guarantee)"
                ));
            }
        }

        for tag in &step.tags {
            if tag.is_empty()
                || !tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                errors.push(format!("step '{name}': invalid tag '{tag}'"));
            }
        }

        for (label, block) in [
            ("on_success", &step.on_success),
            ("on_fail", &step.on_fail),
            ("on_finish", &step.on_finish),
        ] {
            if let Some(block) = block {
                check_transition_targets(name, label, block, &known, &mut errors);
            }
        }

        match step.step_type {
            StepType::Ai if step.prompt.is_none() => {
                errors.push(format!("step '{name}': ai steps require a prompt"));
            }
            StepType::Command if step.exec.is_none() => {
                errors.push(format!("step '{name}': command steps require exec"));
            }
            StepType::Http | StepType::HttpClient | StepType::HttpInput if step.url.is_none() => {
                errors.push(format!(
                    "step '{name}': {} steps require a url",
                    step.step_type.as_str()
                ));
            }
            StepType::Workflow => {
                let names_workflow = step
                    .content
                    .as_ref()
                    .and_then(|c| c.get("workflow"))
                    .and_then(JsonValue::as_str)
                    .is_some();
                if !names_workflow {
                    errors.push(format!(
                        "step '{name}': workflow steps require content.workflow"
                    ));
                }
            }
            _ => {}
        }

        if step.reuse_ai_session.is_some() && step.step_type != StepType::Ai {
            warnings.push(format!(
                "step '{name}': reuse_ai_session has no effect on {} steps",
                step.step_type.as_str()
            ));
        }
    }

    if let Some(scheduler) = &config.scheduler {
        for job in &scheduler.jobs {
            if !known.contains(&job.step.as_str()) {
                errors.push(format!(
                    "scheduler job references unknown step '{}'",
                    job.step
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

fn check_transition_targets(
    step: &str,
    label: &str,
    block: &TransitionBlock,
    known: &[&str],
    errors: &mut Vec<String>,
) {
    let gotos = std::iter::once(&block.goto).chain(block.transitions.iter().map(|rule| &rule.to));
    for goto in gotos {
        if let GotoField::Step(target) = goto {
            if !known.contains(&target.as_str()) {
                errors.push(format!(
                    "step '{step}': {label} goto targets unknown step '{target}'"
                ));
            }
        }
    }

    let runs = block
        .run
        .iter()
        .chain(block.transitions.iter().flat_map(|rule| rule.run.iter()));
    for target in runs {
        if !known.contains(&target.as_str()) {
            errors.push(format!(
                "step '{step}': {label} run references unknown step '{target}'"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_types::StepConfig;

    fn config_with(yaml_steps: &[(&str, &str)]) -> VisorConfig {
        let mut config = VisorConfig::default();
        for (name, yaml) in yaml_steps {
            let mut step: StepConfig = serde_yaml::from_str(yaml).unwrap();
            step.name = name.to_string();
            config.steps.push(step);
        }
        config
    }

    #[test]
    fn session_mode_without_reuse_is_an_error() {
        let config = config_with(&[("a", "type: ai\nprompt: p\nsession_mode: append")]);
        let err = validate_semantics(&config).unwrap_err();
        assert!(err.to_string().contains("session_mode"));
    }

    #[test]
    fn reuse_inherit_requires_dependencies() {
        let config = config_with(&[("a", "type: ai\nprompt: p\nreuse_ai_session: true")]);
        let err = validate_semantics(&config).unwrap_err();
        assert!(err.to_string().contains("depends_on"));
    }

    #[test]
    fn on_finish_requires_for_each() {
        let config = config_with(&[("a", "type: noop\non_finish:\n  run: [a]")]);
        let err = validate_semantics(&config).unwrap_err();
        assert!(err.to_string().contains("forEach"));
    }

    #[test]
    fn criticality_demands_contracts() {
        let bare = config_with(&[("a", "type: ai\nprompt: p\ncriticality: external")]);
        assert!(validate_semantics(&bare).is_err());

        let contracted = config_with(&[(
            "a",
            "type: ai\nprompt: p\ncriticality: external\nassume: \"true\"\nguarantee: \"output != null\"",
        )]);
        assert!(validate_semantics(&contracted).is_ok());
    }

    #[test]
    fn goto_targets_must_exist() {
        let config = config_with(&[("a", "type: noop\non_success:\n  goto: ghost")]);
        let err = validate_semantics(&config).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn bad_tags_are_rejected() {
        let config = config_with(&[("a", "type: noop\ntags: ['has space']")]);
        assert!(validate_semantics(&config).is_err());
    }

    #[test]
    fn or_token_with_one_real_name_passes() {
        let config = config_with(&[
            ("real", "type: noop"),
            ("a", "type: noop\ndepends_on: ['real|phantom']"),
        ]);
        assert!(validate_semantics(&config).is_ok());

        let broken = config_with(&[("a", "type: noop\ndepends_on: ['phantom|ghost']")]);
        assert!(validate_semantics(&broken).is_err());
    }

    #[test]
    fn schema_rejects_unknown_step_type() {
        let document: YamlValue =
            serde_yaml::from_str("steps:\n  bad:\n    type: quantum\n").unwrap();
        assert!(validate_document(&document).is_err());
    }

    #[test]
    fn schema_allows_renderer_tag_and_inline_schema() {
        let document: YamlValue = serde_yaml::from_str(
            "steps:\n  a:\n    type: ai\n    prompt: p\n    schema: markdown\n  b:\n    type: ai\n    prompt: p\n    schema:\n      type: object\n",
        )
        .unwrap();
        assert!(validate_document(&document).is_ok());
    }
}
