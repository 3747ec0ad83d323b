//! Pending human-input prompts. The `human-input` provider parks here after
//! publishing `HumanInputRequested`; a frontend resolves the prompt and the
//! waiting step resumes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
pub struct PromptStore {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl PromptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending prompt; the returned receiver resolves when a
    /// frontend answers. A second registration under the same id replaces
    /// the first, whose receiver then errors out.
    pub fn register(&self, prompt_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(prompt_id.to_string(), tx);
        rx
    }

    /// Deliver an answer. Returns false when the prompt is unknown or the
    /// waiter already went away.
    pub fn resolve(&self, prompt_id: &str, answer: Value) -> bool {
        match self.pending.lock().remove(prompt_id) {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, prompt_id: &str) {
        self.pending.lock().remove(prompt_id);
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }
}
