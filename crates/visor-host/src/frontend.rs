//! Frontend lifecycle. A frontend binds an external event source (chat,
//! webhook UI, custom dashboards) to engine events. The host guarantees
//! that a stopped frontend can no longer observe events from a later run:
//! every subscription taken through the context is dropped on stop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use visor_core::{EventBus, Subscription};
use visor_types::{EventEnvelope, EventKind, VisorConfig};

/// Everything a frontend sees. Subscriptions taken through
/// [`FrontendContext::subscribe`] are tracked and torn down by the host.
#[derive(Clone)]
pub struct FrontendContext {
    pub bus: EventBus,
    pub config: Arc<VisorConfig>,
    /// Identity of the host session this context belongs to.
    pub session_id: String,
    /// Latest inbound payload per webhook endpoint path.
    pub webhook_data: Arc<RwLock<HashMap<String, Value>>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl FrontendContext {
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let subscription = self.bus.on(kind, handler);
        self.subscriptions.lock().push(subscription);
    }
}

#[async_trait]
pub trait Frontend: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, ctx: FrontendContext) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

pub struct FrontendHost {
    bus: EventBus,
    config: Arc<VisorConfig>,
    session_id: String,
    webhook_data: Arc<RwLock<HashMap<String, Value>>>,
    frontends: Vec<Arc<dyn Frontend>>,
    active: Mutex<Vec<(String, Arc<Mutex<Vec<Subscription>>>)>>,
}

impl FrontendHost {
    pub fn new(bus: EventBus, config: Arc<VisorConfig>, session_id: impl Into<String>) -> Self {
        Self {
            bus,
            config,
            session_id: session_id.into(),
            webhook_data: Arc::new(RwLock::new(HashMap::new())),
            frontends: Vec::new(),
            active: Mutex::new(Vec::new()),
        }
    }

    pub fn webhook_data(&self) -> Arc<RwLock<HashMap<String, Value>>> {
        Arc::clone(&self.webhook_data)
    }

    pub fn add(&mut self, frontend: Arc<dyn Frontend>) {
        self.frontends.push(frontend);
    }

    pub async fn start_all(&self) -> anyhow::Result<()> {
        for frontend in &self.frontends {
            let subscriptions = Arc::new(Mutex::new(Vec::new()));
            let ctx = FrontendContext {
                bus: self.bus.clone(),
                config: Arc::clone(&self.config),
                session_id: self.session_id.clone(),
                webhook_data: Arc::clone(&self.webhook_data),
                subscriptions: Arc::clone(&subscriptions),
            };
            frontend.start(ctx).await?;
            self.active
                .lock()
                .push((frontend.name().to_string(), subscriptions));
            info!(frontend = frontend.name(), "frontend started");
        }
        Ok(())
    }

    /// Stop every frontend and drop its subscriptions so no event from a
    /// later run can reach it.
    pub async fn stop_all(&self) {
        for frontend in &self.frontends {
            if let Err(err) = frontend.stop().await {
                warn!(frontend = frontend.name(), error = %err, "frontend stop failed");
            }
        }
        let active: Vec<(String, Arc<Mutex<Vec<Subscription>>>)> =
            self.active.lock().drain(..).collect();
        for (name, subscriptions) in active {
            let drained: Vec<Subscription> = subscriptions.lock().drain(..).collect();
            for subscription in drained {
                subscription.unsubscribe();
            }
            info!(frontend = %name, "frontend detached from the bus");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFrontend {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Frontend for CountingFrontend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn start(&self, ctx: FrontendContext) -> anyhow::Result<()> {
            let seen = Arc::clone(&self.seen);
            ctx.subscribe(EventKind::CheckCompleted, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stopped_frontend_observes_no_further_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let mut host = FrontendHost::new(bus.clone(), Arc::new(VisorConfig::default()), "s-1");
        host.add(Arc::new(CountingFrontend {
            seen: Arc::clone(&seen),
        }));

        host.start_all().await.unwrap();
        bus.emit_kind(EventKind::CheckCompleted, json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        host.stop_all().await;
        bus.emit_kind(EventKind::CheckCompleted, json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
