//! Conversation session registry for `ai`-type steps.
//!
//! `reuse_ai_session: true` inherits the session of the single dependency;
//! a string names the source step. `session_mode: clone` (default) copies
//! the history into a fresh session; `append` shares the source in place so
//! writes by the reusing step are visible to it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// A shared conversation history. Cloning the handle shares the underlying
/// history; use [`SessionRegistry::clone_of`] for a detached copy.
#[derive(Clone, Default)]
pub struct SessionHandle {
    messages: Arc<Mutex<Vec<Value>>>,
}

impl SessionHandle {
    pub fn append(&self, message: Value) {
        self.messages.lock().push(message);
    }

    pub fn history(&self) -> Vec<Value> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    fn detached_copy(&self) -> Self {
        Self {
            messages: Arc::new(Mutex::new(self.history())),
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session recorded for a step, creating an empty one on first use.
    pub fn session_for(&self, step: &str) -> SessionHandle {
        self.sessions
            .lock()
            .entry(step.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, step: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(step).cloned()
    }

    /// Register `step` with a detached copy of `source`'s history.
    pub fn clone_of(&self, step: &str, source: &str) -> SessionHandle {
        let copied = self
            .get(source)
            .map(|handle| handle.detached_copy())
            .unwrap_or_default();
        self.sessions
            .lock()
            .insert(step.to_string(), copied.clone());
        copied
    }

    /// Register `step` against the same shared history as `source`.
    pub fn share_of(&self, step: &str, source: &str) -> SessionHandle {
        let shared = self.session_for(source);
        self.sessions
            .lock()
            .insert(step.to_string(), shared.clone());
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clone_detaches_history_from_the_source() {
        let registry = SessionRegistry::new();
        let source = registry.session_for("planner");
        source.append(json!({"role": "user", "content": "plan"}));

        let cloned = registry.clone_of("reviewer", "planner");
        assert_eq!(cloned.history(), source.history());

        cloned.append(json!({"role": "assistant", "content": "review"}));
        assert_eq!(cloned.len(), 2);
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn append_mode_shares_writes_with_the_source() {
        let registry = SessionRegistry::new();
        let source = registry.session_for("planner");
        source.append(json!({"role": "user", "content": "plan"}));

        let shared = registry.share_of("refiner", "planner");
        shared.append(json!({"role": "assistant", "content": "refined"}));

        assert_eq!(source.len(), 2);
        assert_eq!(registry.session_for("planner").len(), 2);
    }
}
