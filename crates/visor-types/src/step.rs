//! Step configuration — the declarative unit of work.
//!
//! A config file declares a map of named steps (`steps:` preferred,
//! `checks:` accepted). The loader normalizes both spellings into
//! [`StepConfig`] values with `name` filled from the map key; after load the
//! configuration is immutable and shared read-only with the engine.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Which provider executes a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Ai,
    Command,
    Script,
    Http,
    HttpInput,
    HttpClient,
    Log,
    Memory,
    Github,
    Mcp,
    #[serde(rename = "human-input")]
    HumanInput,
    Workflow,
    #[serde(rename = "git-checkout")]
    GitCheckout,
    Noop,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Ai => "ai",
            StepType::Command => "command",
            StepType::Script => "script",
            StepType::Http => "http",
            StepType::HttpInput => "http_input",
            StepType::HttpClient => "http_client",
            StepType::Log => "log",
            StepType::Memory => "memory",
            StepType::Github => "github",
            StepType::Mcp => "mcp",
            StepType::HumanInput => "human-input",
            StepType::Workflow => "workflow",
            StepType::GitCheckout => "git-checkout",
            StepType::Noop => "noop",
        }
    }

    /// Steps of these types produce an `output` value that downstream
    /// contracts (`schema` / `guarantee`) can bind to.
    pub fn is_output_provider(self) -> bool {
        !matches!(self, StepType::Log | StepType::Noop)
    }
}

/// Contract strictness for steps that cross a trust boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    External,
    Internal,
}

/// How dependents of a `forEach` step are scheduled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// One run per item, each in its own scope.
    #[default]
    Map,
    /// A single run at the parent scope, seeing the aggregated outputs.
    Reduce,
}

/// Session reuse for `ai`-type steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReuseSession {
    /// `reuse_ai_session: true` — inherit from the single dependency.
    Inherit,
    /// `reuse_ai_session: "<step>"` — reference a named step's session.
    Named(String),
}

/// `clone` copies the referenced history; `append` shares it in place.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Clone,
    Append,
}

/// `schema` is either a renderer tag (string) or an inline JSON-Schema
/// object validated against the step output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SchemaSpec {
    Renderer(String),
    Inline(Value),
}

/// The `to:` field of a transition rule. `to: null` explicitly suppresses
/// any goto the enclosing block would otherwise produce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GotoField {
    #[default]
    Unset,
    Suppress,
    Step(String),
}

impl GotoField {
    pub fn is_set(&self) -> bool {
        !matches!(self, GotoField::Unset)
    }
}

/// One ordered rule inside a transition block. The first rule whose `when`
/// evaluates truthy wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransitionRule {
    #[serde(default)]
    pub when: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_goto_field",
        skip_serializing_if = "goto_field_is_unset",
        serialize_with = "serialize_goto_field"
    )]
    pub to: GotoField,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub run: Vec<String>,
    #[serde(default)]
    pub goto_event: Option<String>,
}

/// `on_success` / `on_fail` / `on_finish` declarative transitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransitionBlock {
    /// Ordered rules; first truthy `when` wins.
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
    /// Dynamic goto target expression, consulted when no rule matched.
    #[serde(default)]
    pub goto_js: Option<String>,
    /// Dynamic run-list expression, consulted when no rule matched.
    #[serde(default)]
    pub run_js: Option<String>,
    /// Static goto target, lowest precedence.
    #[serde(
        default,
        deserialize_with = "deserialize_goto_field",
        skip_serializing_if = "goto_field_is_unset",
        serialize_with = "serialize_goto_field"
    )]
    pub goto: GotoField,
    /// Static post-steps to schedule in the current scope.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub run: Vec<String>,
    /// Event name to simulate when rewinding via goto.
    #[serde(default)]
    pub goto_event: Option<String>,
}

impl TransitionBlock {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
            && self.goto_js.is_none()
            && self.run_js.is_none()
            && !self.goto.is_set()
            && self.run.is_empty()
    }
}

/// A named, declaratively configured unit of work. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    /// Unique within the config; filled from the map key at normalization.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,

    // Provider inputs. Which one applies depends on `type`.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    /// Cron expression for config-declared static jobs.
    #[serde(default)]
    pub schedule: Option<String>,

    /// Event filter: the step only runs when the trigger event matches
    /// (or the invocation event type is `all`).
    #[serde(default, deserialize_with = "string_or_seq")]
    pub on: Vec<String>,
    /// Dependency names. A token may contain `|` for OR-alternatives;
    /// only real step names participate in graph expansion.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub depends_on: Vec<String>,

    /// Precondition: skip with reason `condition` when false.
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,
    /// Preconditions: skip with reason `assume` when any is false.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub assume: Vec<String>,
    /// Postconditions: violations become `contract/guarantee_failed` issues.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub guarantee: Vec<String>,
    /// Renderer tag or inline JSON-Schema for the step output.
    #[serde(default)]
    pub schema: Option<SchemaSpec>,
    /// Inline JSON-Schema for the step output (alternative spelling).
    #[serde(default)]
    pub output_schema: Option<Value>,
    /// Truthy after completion marks the step failed without throwing.
    #[serde(default)]
    pub fail_if: Option<String>,
    /// Additive failure predicates; any truthy one fails the step.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub failure_conditions: Vec<String>,

    #[serde(default, rename = "forEach")]
    pub for_each: bool,
    #[serde(default)]
    pub fanout: FanoutMode,

    #[serde(default)]
    pub on_success: Option<TransitionBlock>,
    #[serde(default)]
    pub on_fail: Option<TransitionBlock>,
    /// Runs once after all fan-out item scopes complete. Requires `forEach`.
    #[serde(default)]
    pub on_finish: Option<TransitionBlock>,

    #[serde(default, deserialize_with = "string_or_seq")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub criticality: Option<Criticality>,
    /// Per-(step, scope) execution cap; overrides the engine default.
    #[serde(default)]
    pub max_runs: Option<u32>,

    #[serde(
        default,
        deserialize_with = "deserialize_reuse_session",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_reuse_session"
    )]
    pub reuse_ai_session: Option<ReuseSession>,
    #[serde(default)]
    pub session_mode: Option<SessionMode>,

    /// Per-step provider timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// When false, a failure of this step gates its dependents.
    #[serde(default)]
    pub continue_on_failure: Option<bool>,
}

impl StepConfig {
    /// Dependency names with OR-tokens split; duplicates preserved in order.
    pub fn dependency_candidates(&self) -> Vec<&str> {
        self.depends_on
            .iter()
            .flat_map(|token| token.split('|'))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect()
    }
}

fn goto_field_is_unset(field: &GotoField) -> bool {
    !field.is_set()
}

fn serialize_goto_field<S>(field: &GotoField, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match field {
        GotoField::Unset | GotoField::Suppress => serializer.serialize_none(),
        GotoField::Step(name) => serializer.serialize_str(name),
    }
}

fn deserialize_goto_field<'de, D>(deserializer: D) -> Result<GotoField, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(match value {
        None => GotoField::Suppress,
        Some(name) => GotoField::Step(name),
    })
}

fn serialize_reuse_session<S>(
    value: &Option<ReuseSession>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        None => serializer.serialize_none(),
        Some(ReuseSession::Inherit) => serializer.serialize_bool(true),
        Some(ReuseSession::Named(name)) => serializer.serialize_str(name),
    }
}

fn deserialize_reuse_session<'de, D>(deserializer: D) -> Result<Option<ReuseSession>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Name(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None | Some(Raw::Flag(false)) => None,
        Some(Raw::Flag(true)) => Some(ReuseSession::Inherit),
        Some(Raw::Name(name)) => Some(ReuseSession::Named(name)),
    })
}

/// Accept both `field: value` and `field: [a, b]` spellings.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::One(value)) => vec![value],
        Some(Raw::Many(values)) => values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> StepConfig {
        serde_yaml::from_str(yaml).expect("step config parses")
    }

    #[test]
    fn minimal_step_parses_with_defaults() {
        let step = parse("type: noop");
        assert_eq!(step.step_type, StepType::Noop);
        assert!(!step.for_each);
        assert_eq!(step.fanout, FanoutMode::Map);
        assert!(step.depends_on.is_empty());
        assert!(step.reuse_ai_session.is_none());
    }

    #[test]
    fn scalar_fields_widen_to_lists() {
        let step = parse("type: ai\nprompt: hi\non: pr_opened\ndepends_on: fetch\ntags: fast");
        assert_eq!(step.on, vec!["pr_opened"]);
        assert_eq!(step.depends_on, vec!["fetch"]);
        assert_eq!(step.tags, vec!["fast"]);
    }

    #[test]
    fn or_tokens_split_into_candidates() {
        let step = parse("type: noop\ndepends_on:\n  - a|b\n  - c");
        assert_eq!(step.dependency_candidates(), vec!["a", "b", "c"]);
    }

    #[test]
    fn reuse_session_accepts_bool_and_name() {
        let inherit = parse("type: ai\nprompt: p\nreuse_ai_session: true");
        assert_eq!(inherit.reuse_ai_session, Some(ReuseSession::Inherit));
        let named = parse("type: ai\nprompt: p\nreuse_ai_session: planner");
        assert_eq!(
            named.reuse_ai_session,
            Some(ReuseSession::Named("planner".to_string()))
        );
        let off = parse("type: ai\nprompt: p\nreuse_ai_session: false");
        assert!(off.reuse_ai_session.is_none());
    }

    #[test]
    fn goto_null_means_suppress() {
        let block: TransitionBlock =
            serde_yaml::from_str("transitions:\n  - when: \"true\"\n    to: null").unwrap();
        assert_eq!(block.transitions[0].to, GotoField::Suppress);
        let unset: TransitionBlock = serde_yaml::from_str("run: [next]").unwrap();
        assert_eq!(unset.goto, GotoField::Unset);
        assert_eq!(unset.run, vec!["next"]);
    }

    #[test]
    fn schema_accepts_tag_or_inline_object() {
        let tag = parse("type: ai\nprompt: p\nschema: markdown");
        assert_eq!(tag.schema, Some(SchemaSpec::Renderer("markdown".into())));
        let inline = parse("type: ai\nprompt: p\nschema:\n  type: object");
        match inline.schema {
            Some(SchemaSpec::Inline(value)) => assert_eq!(value["type"], "object"),
            other => panic!("expected inline schema, got {other:?}"),
        }
    }
}
