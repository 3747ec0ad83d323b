//! End-to-end engine scenarios: DAG ordering, fan-out, routing budgets,
//! session reuse and stop semantics, driven through real providers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use visor_core::engine::{Engine, EngineOptions, Invocation};
use visor_core::provider::{ExecutionContext, Provider, ProviderRegistry};
use visor_core::{EventBus, PromptStore};
use visor_types::{
    EventKind, InvocationInput, RunConclusion, StepConclusion, StepConfig, StepType, VisorConfig,
};

/// Script provider stand-in: records execution order and replays canned
/// outputs or failures per step name.
struct ScriptedProvider {
    kind: StepType,
    outputs: HashMap<String, Value>,
    failures: Vec<String>,
    delay: Option<Duration>,
    log: Arc<Mutex<Vec<(String, String, Option<Value>)>>>,
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> StepType {
        self.kind
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<visor_types::ProviderOutput> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.log.lock().unwrap().push((
            ctx.step.name.clone(),
            ctx.deps
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            ctx.item.cloned(),
        ));
        if self.failures.contains(&ctx.step.name) {
            anyhow::bail!("scripted failure for {}", ctx.step.name);
        }
        if let Some(session) = &ctx.session {
            session.append(json!({"step": ctx.step.name}));
        }
        let output = self
            .outputs
            .get(&ctx.step.name)
            .cloned()
            .or_else(|| ctx.step.content.clone())
            .unwrap_or(Value::Null);
        Ok(visor_types::ProviderOutput::with_output(output))
    }
}

struct Harness {
    engine: Engine,
    log: Arc<Mutex<Vec<(String, String, Option<Value>)>>>,
}

fn harness(yaml: &str) -> Harness {
    harness_with(yaml, HashMap::new(), Vec::new())
}

fn harness_with(
    yaml: &str,
    outputs: HashMap<String, Value>,
    failures: Vec<String>,
) -> Harness {
    let config: VisorConfig = config_from_yaml(yaml);
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = EventBus::new();
    let providers = ProviderRegistry::with_builtins(bus.clone(), PromptStore::new());
    for kind in [StepType::Ai, StepType::Script] {
        providers.register(Arc::new(ScriptedProvider {
            kind,
            outputs: outputs.clone(),
            failures: failures.clone(),
            delay: None,
            log: Arc::clone(&log),
        }));
    }
    let options = EngineOptions::from_config(&config);
    let engine = Engine::new(Arc::new(config), providers, bus, options);
    Harness { engine, log }
}

/// Parse a `steps:` mapping into a normalized config, preserving order.
fn config_from_yaml(yaml: &str) -> VisorConfig {
    let raw: serde_yaml::Value = serde_yaml::from_str(yaml).expect("yaml parses");
    let mut config = VisorConfig::default();
    if let Some(max) = raw.get("max_parallelism").and_then(|v| v.as_u64()) {
        config.max_parallelism = max as usize;
    }
    if let Some(max_loops) = raw
        .get("routing")
        .and_then(|r| r.get("max_loops"))
        .and_then(|v| v.as_u64())
    {
        config.routing.max_loops = max_loops as u32;
    }
    let steps = raw
        .get("steps")
        .and_then(|s| s.as_mapping())
        .expect("steps mapping");
    for (name, body) in steps {
        let mut step: StepConfig =
            serde_yaml::from_value(body.clone()).expect("step parses");
        step.name = name.as_str().expect("step name").to_string();
        config.steps.push(step);
    }
    config
}

fn run_input(event: &str) -> InvocationInput {
    InvocationInput {
        event_type: event.to_string(),
        ..InvocationInput::default()
    }
}

fn result_of<'a>(
    results: &'a visor_types::GroupedResults,
    step: &str,
    scope: &str,
) -> Option<&'a visor_types::StepResult> {
    results
        .all_results()
        .find(|r| r.step == step && r.scope == scope)
}

#[tokio::test]
async fn dependencies_complete_before_dependents() {
    let h = harness(
        r"
steps:
  fetch:
    type: script
  analyze:
    type: script
    depends_on: [fetch]
  report:
    type: script
    depends_on: [analyze]
",
    );
    let results = h
        .engine
        .run(Invocation::new(vec![], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);
    let order: Vec<String> = h.log.lock().unwrap().iter().map(|(s, _, _)| s.clone()).collect();
    assert_eq!(order, vec!["fetch", "analyze", "report"]);
    // analyze saw fetch's output as a dependency.
    assert_eq!(h.log.lock().unwrap()[1].1, "fetch");
}

#[tokio::test]
async fn fan_out_runs_dependents_per_item_and_on_finish_once() {
    let mut outputs = HashMap::new();
    outputs.insert("produce".to_string(), json!([1, 2, 3]));
    let h = harness_with(
        r"
steps:
  produce:
    type: script
    forEach: true
    on_finish:
      run: [summary]
  consume:
    type: script
    depends_on: [produce]
  summary:
    type: script
",
        outputs,
        Vec::new(),
    );
    let results = h
        .engine
        .run(Invocation::new(vec!["consume".to_string()], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);

    let log = h.log.lock().unwrap();
    let mut consume_items: Vec<i64> = log
        .iter()
        .filter(|(step, _, _)| step == "consume")
        .filter_map(|(_, _, item)| item.as_ref().and_then(Value::as_i64))
        .collect();
    consume_items.sort_unstable();
    // One execution per item; completion order is unordered by design.
    assert_eq!(consume_items, vec![1, 2, 3]);

    let summaries = log.iter().filter(|(step, _, _)| step == "summary").count();
    assert_eq!(summaries, 1);
    // summary ran after all three consume executions.
    let last_consume = log.iter().rposition(|(s, _, _)| s == "consume").unwrap();
    let summary_pos = log.iter().position(|(s, _, _)| s == "summary").unwrap();
    assert!(summary_pos > last_consume);
}

#[tokio::test]
async fn fanout_reduce_sees_the_whole_array_once() {
    let mut outputs = HashMap::new();
    outputs.insert("produce".to_string(), json!(["a", "b"]));
    let h = harness_with(
        r"
steps:
  produce:
    type: script
    forEach: true
  aggregate:
    type: script
    depends_on: [produce]
    fanout: reduce
",
        outputs,
        Vec::new(),
    );
    let results = h
        .engine
        .run(Invocation::new(vec!["aggregate".to_string()], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);
    let aggregate = result_of(&results, "aggregate", "").expect("aggregate ran at root scope");
    assert!(aggregate.conclusion.is_success());
    let runs = h
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|(s, _, _)| s == "aggregate")
        .count();
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn goto_loop_respects_the_routing_budget() {
    // loop_a re-enters itself; with max_loops 2 the third transition is
    // refused and the invocation still completes.
    let h = harness(
        r"
routing:
  max_loops: 2
steps:
  loop_a:
    type: script
    on_success:
      goto: loop_a
",
    );
    let results = h
        .engine
        .run(Invocation::new(vec!["loop_a".to_string()], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);
    let executions = h
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|(s, _, _)| s == "loop_a")
        .count();
    assert_eq!(executions, 3);
    let result = result_of(&results, "loop_a", "").unwrap();
    assert!(result
        .issues
        .iter()
        .any(|issue| issue.rule_id == "contract/budget_exceeded"));
}

#[tokio::test]
async fn max_runs_caps_executions_per_step_and_scope() {
    // The routing budget is generous; the per-step run cap trips first.
    let h = harness(
        r"
routing:
  max_loops: 10
steps:
  churn:
    type: script
    max_runs: 2
    on_success:
      goto: churn
",
    );
    let results = h
        .engine
        .run(Invocation::new(vec!["churn".to_string()], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);
    let executions = h
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|(s, _, _)| s == "churn")
        .count();
    assert_eq!(executions, 2);
    let result = result_of(&results, "churn", "").unwrap();
    assert!(result.conclusion.is_failed());
    assert!(result
        .issues
        .iter()
        .any(|issue| issue.rule_id == "contract/budget_exceeded"));
}

#[tokio::test]
async fn failed_dependency_gates_dependents() {
    let h = harness_with(
        r"
steps:
  fetch:
    type: script
  analyze:
    type: script
    depends_on: [fetch]
",
        HashMap::new(),
        vec!["fetch".to_string()],
    );
    let results = h
        .engine
        .run(Invocation::new(vec!["analyze".to_string()], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);
    let fetch = result_of(&results, "fetch", "").unwrap();
    assert!(fetch.conclusion.is_failed());
    let analyze = result_of(&results, "analyze", "").unwrap();
    assert_eq!(
        analyze.conclusion,
        StepConclusion::Skipped {
            reason: visor_types::SkipReason::DependencyFailed
        }
    );
}

#[tokio::test]
async fn continue_on_failure_lets_dependents_run() {
    let h = harness_with(
        r"
steps:
  fetch:
    type: script
    continue_on_failure: true
  analyze:
    type: script
    depends_on: [fetch]
",
        HashMap::new(),
        vec!["fetch".to_string()],
    );
    let results = h
        .engine
        .run(Invocation::new(vec!["analyze".to_string()], run_input("all")))
        .await;
    let analyze = result_of(&results, "analyze", "").unwrap();
    assert!(analyze.conclusion.is_success());
}

#[tokio::test]
async fn event_filter_skips_non_matching_steps() {
    let h = harness(
        r"
steps:
  on_push:
    type: script
    on: [push]
  on_pr:
    type: script
    on: [pr_opened]
",
    );
    let results = h
        .engine
        .run(Invocation::new(vec![], run_input("push")))
        .await;
    let pushed = result_of(&results, "on_push", "").unwrap();
    assert!(pushed.conclusion.is_success());
    let pr = result_of(&results, "on_pr", "").unwrap();
    assert_eq!(
        pr.conclusion,
        StepConclusion::Skipped {
            reason: visor_types::SkipReason::Event
        }
    );
}

#[tokio::test]
async fn on_fail_routes_to_recovery_step() {
    let h = harness_with(
        r"
steps:
  flaky:
    type: script
    on_fail:
      run: [cleanup]
  cleanup:
    type: script
",
        HashMap::new(),
        vec!["flaky".to_string()],
    );
    let results = h
        .engine
        .run(Invocation::new(vec!["flaky".to_string()], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);
    let cleanup = result_of(&results, "cleanup", "").unwrap();
    assert!(cleanup.conclusion.is_success());
}

#[tokio::test]
async fn session_clone_and_append_semantics() {
    let mut outputs = HashMap::new();
    outputs.insert("planner".to_string(), json!("plan"));
    let h = harness_with(
        r"
steps:
  planner:
    type: ai
    prompt: plan
  reviewer:
    type: ai
    prompt: review
    depends_on: [planner]
    reuse_ai_session: true
  refiner:
    type: ai
    prompt: refine
    depends_on: [reviewer]
    reuse_ai_session: planner
    session_mode: append
",
        outputs,
        Vec::new(),
    );
    let results = h
        .engine
        .run(Invocation::new(vec!["refiner".to_string()], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);

    let sessions = h.engine.sessions();
    // planner wrote one message; reviewer cloned it then wrote its own,
    // which must not leak back into planner's history.
    let planner = sessions.get("planner").unwrap();
    let reviewer = sessions.get("reviewer").unwrap();
    assert_eq!(reviewer.len(), 2);
    // refiner appended in place, so planner's shared history grew.
    assert_eq!(planner.len(), 2);
    assert_eq!(
        planner.history()[1],
        json!({"step": "refiner"})
    );
}

#[tokio::test]
async fn max_parallelism_bounds_concurrent_steps() {
    let config = config_from_yaml(
        r"
max_parallelism: 2
steps:
  a:
    type: script
  b:
    type: script
  c:
    type: script
  d:
    type: script
",
    );
    let concurrent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    struct CountingProvider {
        concurrent: Arc<std::sync::atomic::AtomicUsize>,
        peak: Arc<std::sync::atomic::AtomicUsize>,
    }
    #[async_trait]
    impl Provider for CountingProvider {
        fn kind(&self) -> StepType {
            StepType::Script
        }
        async fn execute(
            &self,
            _ctx: ExecutionContext<'_>,
        ) -> anyhow::Result<visor_types::ProviderOutput> {
            use std::sync::atomic::Ordering;
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(25)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(visor_types::ProviderOutput::default())
        }
    }

    let bus = EventBus::new();
    let providers = ProviderRegistry::new();
    providers.register(Arc::new(CountingProvider {
        concurrent: Arc::clone(&concurrent),
        peak: Arc::clone(&peak),
    }));
    let options = EngineOptions::from_config(&config);
    let engine = Engine::new(Arc::new(config), providers, bus, options);
    let results = engine.run(Invocation::new(vec![], run_input("all"))).await;
    assert_eq!(results.conclusion, RunConclusion::Completed);
    assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn stop_unwinds_to_stopped_preserving_results() {
    let config = config_from_yaml(
        r"
max_parallelism: 1
steps:
  first:
    type: script
  second:
    type: script
    depends_on: [first]
",
    );
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let providers = ProviderRegistry::new();
    providers.register(Arc::new(ScriptedProvider {
        kind: StepType::Script,
        outputs: HashMap::new(),
        failures: Vec::new(),
        delay: Some(Duration::from_millis(50)),
        log: Arc::clone(&log),
    }));
    let options = EngineOptions::from_config(&config);
    let engine = Engine::new(Arc::new(config), providers, bus, options);

    let gate = engine.gate().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.stop();
    });
    let results = engine
        .run(Invocation::new(vec![], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Stopped);
    // The in-flight provider finished and its result was recorded.
    assert!(result_of(&results, "first", "").is_some());
    assert!(result_of(&results, "second", "").is_none());
}

#[tokio::test]
async fn unregistered_provider_type_fails_the_step_only() {
    let h = harness(
        r"
steps:
  review:
    type: github
  local:
    type: script
",
    );
    let results = h
        .engine
        .run(Invocation::new(vec![], run_input("all")))
        .await;
    assert_eq!(results.conclusion, RunConclusion::Completed);
    let review = result_of(&results, "review", "").unwrap();
    assert!(review.conclusion.is_failed());
    assert!(review.error.as_deref().unwrap_or_default().contains("github"));
    assert!(result_of(&results, "local", "").unwrap().conclusion.is_success());
}

#[tokio::test]
async fn state_transitions_are_published_in_order() {
    let h = harness("steps:\n  only:\n    type: script\n");
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let _sub = h.engine.bus().on(EventKind::StateTransition, move |envelope| {
        sink.lock().unwrap().push((
            envelope.payload["from"].as_str().unwrap().to_string(),
            envelope.payload["to"].as_str().unwrap().to_string(),
        ));
    });
    let _ = h
        .engine
        .run(Invocation::new(vec![], run_input("all")))
        .await;
    let states = states.lock().unwrap();
    assert_eq!(
        *states,
        vec![
            ("idle".to_string(), "planning".to_string()),
            ("planning".to_string(), "running".to_string()),
            ("running".to_string(), "completed".to_string()),
        ]
    );
}
