//! Engine state machine. Every transition is published on the event bus as
//! a `StateTransition` envelope carrying `{from, to}`.

use serde_json::json;
use tracing::debug;

use visor_types::{EngineState, EventKind};

use crate::bus::EventBus;

pub struct StateMachine {
    current: EngineState,
    run_id: String,
    bus: EventBus,
}

impl StateMachine {
    pub fn new(run_id: &str, bus: EventBus) -> Self {
        Self {
            current: EngineState::Idle,
            run_id: run_id.to_string(),
            bus,
        }
    }

    pub fn current(&self) -> EngineState {
        self.current
    }

    fn allowed(from: EngineState, to: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (from, to),
            (Idle, Planning)
                | (Planning, Running)
                | (Planning, Error)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Paused, Error)
        )
    }

    /// Move to `to` if the transition is legal; illegal transitions are
    /// ignored with a debug log so an already-terminal run stays terminal.
    pub fn transition(&mut self, to: EngineState) {
        if self.current == to {
            return;
        }
        if !Self::allowed(self.current, to) {
            debug!(from = ?self.current, ?to, "ignoring illegal state transition");
            return;
        }
        let from = self.current;
        self.current = to;
        self.bus.emit_kind(
            EventKind::StateTransition,
            json!({"run_id": self.run_id, "from": from, "to": to}),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn lifecycle_transitions_are_published() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.on(EventKind::StateTransition, move |envelope| {
            sink.lock().unwrap().push((
                envelope.payload["from"].as_str().unwrap().to_string(),
                envelope.payload["to"].as_str().unwrap().to_string(),
            ));
        });
        let mut machine = StateMachine::new("run-1", bus);
        machine.transition(EngineState::Planning);
        machine.transition(EngineState::Running);
        machine.transition(EngineState::Paused);
        machine.transition(EngineState::Running);
        machine.transition(EngineState::Completed);
        assert_eq!(machine.current(), EngineState::Completed);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], ("idle".to_string(), "planning".to_string()));
        assert_eq!(seen[4], ("running".to_string(), "completed".to_string()));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut machine = StateMachine::new("run-2", EventBus::new());
        machine.transition(EngineState::Planning);
        machine.transition(EngineState::Running);
        machine.transition(EngineState::Stopped);
        machine.transition(EngineState::Running);
        assert_eq!(machine.current(), EngineState::Stopped);
    }
}
