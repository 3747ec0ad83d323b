//! Glue between the scheduler and the engine, plus the concrete output
//! adapters that are not external collaborators.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use visor_core::engine::{Engine, Invocation};
use visor_schedule::scheduler::{OutputAdapter, ScheduleExecutor};
use visor_types::{InvocationInput, RunConclusion, Schedule, ScheduleOutcome};

/// Runs a schedule's workflow through the engine with a synthetic trigger
/// payload keyed by the schedule's webhook-style endpoint path.
pub struct EngineExecutor {
    engine: Engine,
}

impl EngineExecutor {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduleExecutor for EngineExecutor {
    async fn execute(&self, schedule: &Schedule) -> anyhow::Result<ScheduleOutcome> {
        let endpoint = format!("schedule/{}", schedule.id);
        let input = InvocationInput {
            run_id: format!("schedule-{}-{}", schedule.id, uuid::Uuid::new_v4()),
            event_type: "schedule".to_string(),
            payload: json!({ endpoint: schedule.inputs }),
            env: HashMap::new(),
        };
        // A named workflow runs that step's subgraph; a bare reminder runs
        // every configured step.
        let roots = schedule
            .workflow
            .clone()
            .map(|step| vec![step])
            .unwrap_or_default();
        let results = self.engine.run(Invocation::new(roots, input)).await;

        let failed_steps: Vec<String> = results
            .all_results()
            .filter(|result| result.conclusion.is_failed())
            .map(|result| result.step.clone())
            .collect();
        let mut output = Map::new();
        for result in results.all_results() {
            if result.scope.is_empty() && !result.output.is_null() {
                output.insert(result.step.clone(), result.output.clone());
            }
        }

        let success = results.conclusion == RunConclusion::Completed && failed_steps.is_empty();
        Ok(ScheduleOutcome {
            success,
            output: Value::Object(output),
            error: if failed_steps.is_empty() {
                None
            } else {
                Some(format!("steps failed: {}", failed_steps.join(", ")))
            },
        })
    }
}

/// Posts `(schedule, outcome)` as JSON to the schedule's target URL.
pub struct WebhookOutputAdapter {
    client: reqwest::Client,
}

impl WebhookOutputAdapter {
    pub fn new(timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl OutputAdapter for WebhookOutputAdapter {
    async fn deliver(&self, schedule: &Schedule, outcome: &ScheduleOutcome) -> anyhow::Result<()> {
        let Some(target) = schedule.output.target.as_deref() else {
            anyhow::bail!("schedule '{}' has no webhook target", schedule.id);
        };
        self.client
            .post(target)
            .json(&json!({
                "schedule_id": schedule.id,
                "success": outcome.success,
                "output": outcome.output,
                "error": outcome.error,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use visor_core::engine::EngineOptions;
    use visor_core::{EventBus, PromptStore, ProviderRegistry};
    use visor_types::{StepConfig, VisorConfig};

    fn engine_with_steps(steps: &[(&str, &str)]) -> Engine {
        let mut config = VisorConfig::default();
        for (name, yaml) in steps {
            let mut step: StepConfig = serde_yaml::from_str(yaml).unwrap();
            step.name = name.to_string();
            config.steps.push(step);
        }
        let bus = EventBus::new();
        let providers = ProviderRegistry::with_builtins(bus.clone(), PromptStore::new());
        let options = EngineOptions::from_config(&config);
        Engine::new(Arc::new(config), providers, bus, options)
    }

    #[tokio::test]
    async fn named_workflow_runs_only_that_subgraph() {
        let engine = engine_with_steps(&[
            ("greet", "type: noop\ncontent:\n  message: hello"),
            ("other", "type: noop\ncontent: 42"),
        ]);
        let executor = EngineExecutor::new(engine);
        let mut schedule = Schedule::one_shot(chrono::Utc::now());
        schedule.workflow = Some("greet".to_string());

        let outcome = executor.execute(&schedule).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output["greet"]["message"], "hello");
        assert!(outcome.output.get("other").is_none());
    }

    #[tokio::test]
    async fn failed_step_turns_the_outcome_unsuccessful() {
        let engine = engine_with_steps(&[("broken", "type: command\nexec: \"exit 1\"")]);
        let executor = EngineExecutor::new(engine);
        let mut schedule = Schedule::one_shot(chrono::Utc::now());
        schedule.workflow = Some("broken".to_string());

        let outcome = executor.execute(&schedule).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("broken"));
    }
}
