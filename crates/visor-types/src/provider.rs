use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::Issue;

/// Input payload for one invocation. Built by a trigger (webhook, chat,
/// scheduler, CLI) and carried unchanged through the run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InvocationInput {
    pub run_id: String,
    /// Trigger event type; `all` matches every `on` filter.
    pub event_type: String,
    /// Trigger payload, keyed by webhook endpoint path for synthetic
    /// scheduler triggers.
    #[serde(default)]
    pub payload: Value,
    /// Resolved environment passed to expressions as `env`. The engine
    /// never reads the process environment itself.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// What a provider hands back to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderOutput {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub debug: Option<Value>,
}

impl ProviderOutput {
    pub fn with_output(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

/// Dependency outputs visible to a step: name → output value of the
/// closest completed result walking up the scope chain.
pub type DependencyOutputs = HashMap<String, Value>;
