//! Trigger ingestion: the admission pipeline between an inbound event and
//! an engine invocation. Every trigger passes the rate limiter, then the
//! worker pool; only admitted work materializes an [`Invocation`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use visor_core::engine::{Engine, Invocation};
use visor_core::{
    AdmissionDecision, PoolConfig, RateLimitConfig, RateLimiter, RateRequest, WorkItem, WorkerPool,
};
use visor_types::InvocationInput;

/// One inbound trigger, queued through the worker pool.
#[derive(Debug, Clone)]
pub struct TriggerJob {
    /// Webhook endpoint path or chat channel the trigger arrived on.
    pub endpoint: String,
    pub event_type: String,
    pub payload: Value,
    /// Root steps to run; empty means every configured step.
    pub roots: Vec<String>,
    /// Identity for the paired rate-limiter release.
    pub identity: RateRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    /// Queued; carries the work item id.
    Accepted { work_id: String },
    /// Rate limiter said no; 429-equivalent.
    RateLimited { retry_after_secs: i64 },
    /// Worker pool is saturated; 503-equivalent.
    Busy,
}

pub struct TriggerService {
    limiter: Arc<RateLimiter>,
    pool: WorkerPool<TriggerJob>,
    webhook_data: Arc<RwLock<HashMap<String, Value>>>,
}

impl TriggerService {
    pub fn new(
        engine: Engine,
        limits: RateLimitConfig,
        pool_config: PoolConfig,
        webhook_data: Arc<RwLock<HashMap<String, Value>>>,
    ) -> Arc<Self> {
        let limiter = Arc::new(RateLimiter::new(limits));
        let task_limiter = Arc::clone(&limiter);
        let task_data = Arc::clone(&webhook_data);
        let pool = WorkerPool::new(pool_config, move |item: WorkItem<TriggerJob>| {
            let engine = engine.clone();
            let limiter = Arc::clone(&task_limiter);
            let data = Arc::clone(&task_data);
            Box::pin(async move {
                let job = item.data;
                data.write()
                    .await
                    .insert(job.endpoint.clone(), job.payload.clone());
                let input = InvocationInput {
                    run_id: item.id.clone(),
                    event_type: job.event_type.clone(),
                    payload: json!({ job.endpoint.clone(): job.payload }),
                    env: HashMap::new(),
                };
                let results = engine.run(Invocation::new(job.roots.clone(), input)).await;
                info!(
                    run_id = %results.run_id,
                    conclusion = ?results.conclusion,
                    issues = results.issues().len(),
                    "trigger run finished"
                );
                limiter.release(&job.identity);
                Ok(())
            })
        });
        Arc::new(Self {
            limiter,
            pool,
            webhook_data,
        })
    }

    /// Admit a trigger. The rate limiter decides first; a near-limit queue
    /// hint demotes the work's priority instead of rejecting it.
    pub fn submit(&self, job: TriggerJob, priority: i32) -> TriggerDecision {
        let decision = self.limiter.check(&job.identity);
        let priority = match decision {
            AdmissionDecision::Blocked {
                retry_after_secs, ..
            } => {
                debug!(endpoint = %job.endpoint, retry_after_secs, "trigger rate limited");
                return TriggerDecision::RateLimited { retry_after_secs };
            }
            AdmissionDecision::ShouldQueue { .. } => priority.saturating_sub(10),
            AdmissionDecision::Allowed { .. } => priority,
        };

        let identity = job.identity.clone();
        let item = WorkItem::new(job, priority);
        let work_id = item.id.clone();
        if self.pool.submit(item) {
            TriggerDecision::Accepted { work_id }
        } else {
            // The admission was recorded; hand the slot back.
            self.limiter.release(&identity);
            TriggerDecision::Busy
        }
    }

    pub fn webhook_data(&self) -> Arc<RwLock<HashMap<String, Value>>> {
        Arc::clone(&self.webhook_data)
    }

    pub fn pool_status(&self) -> visor_core::PoolStatus {
        self.pool.status()
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use visor_core::engine::EngineOptions;
    use visor_core::{DimensionLimits, EventBus, PromptStore, ProviderRegistry};
    use visor_types::VisorConfig;

    fn engine() -> Engine {
        let mut config = VisorConfig::default();
        let mut step: visor_types::StepConfig = serde_yaml::from_str("type: noop").unwrap();
        step.name = "only".to_string();
        config.steps.push(step);
        let bus = EventBus::new();
        let providers = ProviderRegistry::with_builtins(bus.clone(), PromptStore::new());
        let options = EngineOptions::from_config(&config);
        Engine::new(Arc::new(config), providers, bus, options)
    }

    fn service(per_minute: u32, queue_capacity: usize) -> Arc<TriggerService> {
        TriggerService::new(
            engine(),
            RateLimitConfig {
                user: Some(DimensionLimits {
                    requests_per_minute: per_minute,
                    ..DimensionLimits::default()
                }),
                ..RateLimitConfig::default()
            },
            PoolConfig {
                pool_size: 1,
                queue_capacity,
                task_timeout: Duration::from_secs(5),
                ..PoolConfig::default()
            },
            Arc::new(RwLock::new(HashMap::new())),
        )
    }

    fn job(user: &str) -> TriggerJob {
        TriggerJob {
            endpoint: "ci".to_string(),
            event_type: "push".to_string(),
            payload: json!({"ref": "main"}),
            roots: vec![],
            identity: RateRequest {
                user: Some(user.to_string()),
                ..RateRequest::default()
            },
        }
    }

    #[tokio::test]
    async fn rate_limited_triggers_get_a_retry_hint() {
        let service = service(2, 16);
        assert!(matches!(
            service.submit(job("alice"), 0),
            TriggerDecision::Accepted { .. }
        ));
        assert!(matches!(
            service.submit(job("alice"), 0),
            TriggerDecision::Accepted { .. }
        ));
        match service.submit(job("alice"), 0) {
            TriggerDecision::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        service.shutdown().await;
    }

    #[tokio::test]
    async fn accepted_triggers_run_and_record_webhook_data() {
        let service = service(100, 16);
        let decision = service.submit(job("bob"), 0);
        assert!(matches!(decision, TriggerDecision::Accepted { .. }));
        for _ in 0..100 {
            if service.webhook_data().read().await.contains_key("ci") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let data = service.webhook_data();
        let data = data.read().await;
        assert_eq!(data["ci"]["ref"], "main");
        service.shutdown().await;
    }
}
