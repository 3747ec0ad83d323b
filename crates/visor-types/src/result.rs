use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A single finding attached to a step result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    /// Stable identifier, e.g. `contract/guarantee_failed`.
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl Issue {
    pub fn new(rule_id: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity,
            message: message.into(),
            step: None,
            scope: None,
        }
    }

    pub fn for_step(mut self, step: &str, scope: &str) -> Self {
        self.step = Some(step.to_string());
        self.scope = Some(scope.to_string());
        self
    }
}

/// Why a step was skipped without executing its provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `if` evaluated false.
    Condition,
    /// An `assume` expression evaluated false.
    Assume,
    /// The trigger event did not match the step's `on` filter.
    Event,
    /// The invocation tag filter excluded the step.
    Tag,
    /// An upstream dependency failed and gated this step.
    DependencyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepConclusion {
    Success,
    Failed,
    Skipped { reason: SkipReason },
}

impl StepConclusion {
    pub fn is_success(&self) -> bool {
        matches!(self, StepConclusion::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepConclusion::Failed)
    }
}

/// Outcome of one step execution in one scope. Exactly one exists per
/// (step, scope) pair at the end of an engine run; a goto replaces the
/// previous result for the rewound pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: String,
    /// Scope id; empty string for the root scope.
    pub scope: String,
    pub conclusion: StepConclusion,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Terminal state of an invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Completed,
    Error,
    Stopped,
}

/// Results of one engine run, grouped by root step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupedResults {
    pub run_id: String,
    pub conclusion: RunConclusion,
    /// Root step name → results of the root and everything it pulled in,
    /// in completion order.
    pub groups: BTreeMap<String, Vec<StepResult>>,
    /// Run-level issues not attributable to a single step, e.g. a truthy
    /// top-level `fail_if`.
    #[serde(default)]
    pub run_issues: Vec<Issue>,
    pub duration_ms: u64,
}

impl GroupedResults {
    /// All issues across all groups and scopes, flattened for reporting.
    pub fn issues(&self) -> Vec<&Issue> {
        self.run_issues
            .iter()
            .chain(
                self.groups
                    .values()
                    .flat_map(|results| results.iter())
                    .flat_map(|result| result.issues.iter()),
            )
            .collect()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues()
            .iter()
            .any(|issue| issue.severity == Severity::Critical)
    }

    pub fn all_results(&self) -> impl Iterator<Item = &StepResult> {
        self.groups.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_flatten_across_groups_and_scopes() {
        let mut groups = BTreeMap::new();
        let result = |step: &str, scope: &str, rule: &str| StepResult {
            step: step.to_string(),
            scope: scope.to_string(),
            conclusion: StepConclusion::Success,
            issues: vec![Issue::new(rule, Severity::Warning, "w").for_step(step, scope)],
            output: Value::Null,
            content: None,
            error: None,
            duration_ms: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        groups.insert(
            "a".to_string(),
            vec![result("a", "", "r1"), result("b", "a[0]", "r2")],
        );
        groups.insert("c".to_string(), vec![result("c", "", "r3")]);
        let grouped = GroupedResults {
            run_id: "run".to_string(),
            conclusion: RunConclusion::Completed,
            groups,
            run_issues: Vec::new(),
            duration_ms: 3,
        };
        assert_eq!(grouped.issues().len(), 3);
        assert!(!grouped.has_critical_issues());
    }
}
