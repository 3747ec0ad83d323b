//! In-process typed pub/sub. Handlers run synchronously in registration
//! order; a panic in one handler is isolated and later handlers still fire.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

use visor_types::{EventEnvelope, EventKind};

type Handler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

struct Registered {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    handlers: HashMap<EventKind, Vec<Registered>>,
}

struct BusInner {
    seq: AtomicU64,
    next_id: AtomicU64,
    state: Mutex<BusState>,
}

/// Handle returned by [`EventBus::on`]; dropping it without calling
/// [`Subscription::unsubscribe`] leaves the handler registered.
pub struct Subscription {
    inner: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.state.lock();
            if let Some(list) = state.handlers.get_mut(&self.kind) {
                list.retain(|registered| registered.id != self.id);
            }
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                seq: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .state
            .lock()
            .handlers
            .entry(kind)
            .or_default()
            .push(Registered {
                id,
                handler: Arc::new(handler),
            });
        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Deliver `envelope` to every current subscriber of its kind, in
    /// registration order. At-most-once per subscriber per emit; no
    /// persistence, no replay.
    pub fn emit(&self, mut envelope: EventEnvelope) {
        envelope.seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let handlers: Vec<Handler> = {
            let state = self.inner.state.lock();
            state
                .handlers
                .get(&envelope.kind)
                .map(|list| list.iter().map(|r| Arc::clone(&r.handler)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope))).is_err() {
                error!(kind = ?envelope.kind, seq = envelope.seq, "event handler panicked");
            }
        }
    }

    pub fn emit_kind(&self, kind: EventKind, payload: serde_json::Value) {
        self.emit(EventEnvelope::new(kind, payload));
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .state
            .lock()
            .handlers
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
