use serde::{Deserialize, Serialize};

/// The intent produced by evaluating a transition block. The routing
/// evaluator never performs side effects; the engine checks budgets and
/// dispatches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingIntent {
    #[default]
    None,
    /// Rewind execution to a named ancestor step, optionally re-tagging the
    /// simulated trigger event.
    Goto {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
    /// Schedule post-steps in the current scope.
    Run { steps: Vec<String> },
}

impl RoutingIntent {
    pub fn is_none(&self) -> bool {
        matches!(self, RoutingIntent::None)
    }
}
