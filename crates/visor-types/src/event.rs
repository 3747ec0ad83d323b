use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine lifecycle states. Transitions are published on the event bus as
/// [`EventKind::StateTransition`] envelopes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Planning,
    Running,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Error | EngineState::Stopped
        )
    }
}

/// Event types recognized on the in-process bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CheckScheduled,
    CheckStarted,
    CheckCompleted,
    CheckErrored,
    StateTransition,
    HumanInputRequested,
    SnapshotSaved,
}

/// Typed envelope delivered to subscribers. `seq` is monotonic per bus and
/// establishes per-emitter ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
    pub seq: u64,
    /// Optional wrapper metadata (`{payload, meta}` form).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl EventEnvelope {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            seq: 0,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}
