//! The execution engine: a state machine over the step DAG.
//!
//! One [`Invocation`] traverses the configured steps from a set of roots,
//! honoring dependencies, fan-out scopes, contracts, routing budgets and
//! the pause/stop gate, and returns [`GroupedResults`]. Provider errors
//! never escape the run; the engine itself only reaches the `Error`
//! terminal state on an internal invariant violation, preserving partial
//! results.

pub mod contracts;
pub mod gate;
pub mod prompt;
pub mod resolve;
pub mod session;
pub mod state;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn, Level};
use uuid::Uuid;
use visor_observability::{emit_event, LifecycleEvent};

use visor_types::{
    EngineLimits, EngineState, EventKind, FanoutMode, GroupedResults, InvocationInput, Issue,
    ProviderOutput, ReuseSession, RoutingIntent, RunConclusion, SessionMode, Severity, SkipReason,
    StepConclusion, StepConfig, StepResult, StepType, TagFilter, TransitionBlock, RoutingLimits,
    VisorConfig,
};

use crate::bus::EventBus;
use crate::provider::{ExecutionContext, Provider, ProviderRegistry, RunMemory};
use crate::routing::{self, PreconditionCheck, RoutingContext};
use contracts::RULE_BUDGET;
use gate::{ControlGate, Stopped};
use resolve::{Plan, PlanError};
use session::{SessionHandle, SessionRegistry};
use state::StateMachine;

const RULE_PROVIDER: &str = "error/provider";
const RULE_TIMEOUT: &str = "error/timeout";
const RULE_ROUTING: &str = "routing/invalid_target";
const RULE_RUN_FAIL_IF: &str = "run/fail_if";

type StepKey = (String, String);

/// Resolved engine options. The engine never reads the process
/// environment; the binary resolves everything into this record.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_parallelism: usize,
    pub fail_fast: bool,
    pub tag_filter: Option<TagFilter>,
    pub limits: EngineLimits,
    pub routing: RoutingLimits,
    /// Run-level failure predicate from the top-level config.
    pub run_fail_if: Option<String>,
    /// Applied when a step declares no `timeout_ms` of its own.
    pub default_step_timeout: Option<Duration>,
}

impl EngineOptions {
    pub fn from_config(config: &VisorConfig) -> Self {
        Self {
            max_parallelism: config.max_parallelism.max(1),
            fail_fast: config.fail_fast,
            tag_filter: config.tag_filter.clone(),
            limits: config.limits.clone(),
            routing: config.routing.clone(),
            run_fail_if: config.fail_if.clone(),
            default_step_timeout: None,
        }
    }
}

/// One requested traversal of the DAG.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub run_id: String,
    /// Root step names; empty means every configured step.
    pub roots: Vec<String>,
    pub input: InvocationInput,
    /// Overrides the engine-level tag filter when set.
    pub tag_filter: Option<TagFilter>,
    /// Nested workflow depth; zero for trigger-originated runs.
    pub depth: u32,
}

impl Invocation {
    pub fn new(roots: Vec<String>, input: InvocationInput) -> Self {
        let run_id = if input.run_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            input.run_id.clone()
        };
        Self {
            run_id,
            roots,
            input,
            tag_filter: None,
            depth: 0,
        }
    }
}

struct EngineInner {
    config: Arc<VisorConfig>,
    providers: ProviderRegistry,
    bus: EventBus,
    gate: ControlGate,
    sessions: SessionRegistry,
    options: EngineOptions,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: Arc<VisorConfig>,
        providers: ProviderRegistry,
        bus: EventBus,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                providers,
                bus,
                gate: ControlGate::new(),
                sessions: SessionRegistry::new(),
                options,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn gate(&self) -> &ControlGate {
        &self.inner.gate
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn config(&self) -> &Arc<VisorConfig> {
        &self.inner.config
    }

    /// Execute one invocation to a terminal state. Never panics or errors;
    /// failures are carried inside the returned results.
    pub async fn run(&self, invocation: Invocation) -> GroupedResults {
        let started = Utc::now();
        let mut machine = StateMachine::new(&invocation.run_id, self.inner.bus.clone());
        emit_event(
            Level::INFO,
            LifecycleEvent {
                run_id: Some(&invocation.run_id),
                status: Some("start"),
                ..LifecycleEvent::new("run", "engine")
            },
        );
        machine.transition(EngineState::Planning);

        if invocation.depth > self.inner.options.limits.max_workflow_depth {
            machine.transition(EngineState::Error);
            return GroupedResults {
                run_id: invocation.run_id,
                conclusion: RunConclusion::Error,
                groups: BTreeMap::new(),
                run_issues: vec![Issue::new(
                    RULE_BUDGET,
                    Severity::Critical,
                    format!(
                        "workflow depth {} exceeds the allowed {}",
                        invocation.depth, self.inner.options.limits.max_workflow_depth
                    ),
                )],
                duration_ms: elapsed_ms(started),
            };
        }

        let plan = match resolve::plan(&self.inner.config, &invocation.roots) {
            Ok(plan) => plan,
            Err(err) => {
                machine.transition(EngineState::Error);
                return GroupedResults {
                    run_id: invocation.run_id,
                    conclusion: RunConclusion::Error,
                    groups: BTreeMap::new(),
                    run_issues: vec![plan_issue(&err)],
                    duration_ms: elapsed_ms(started),
                };
            }
        };

        machine.transition(EngineState::Running);
        let mut driver = RunDriver::new(self, &invocation, plan);
        let conclusion = driver.drive(&mut machine).await;
        machine.transition(match conclusion {
            RunConclusion::Completed => EngineState::Completed,
            RunConclusion::Error => EngineState::Error,
            RunConclusion::Stopped => EngineState::Stopped,
        });
        emit_event(
            Level::INFO,
            LifecycleEvent {
                run_id: Some(&invocation.run_id),
                status: Some(match conclusion {
                    RunConclusion::Completed => "completed",
                    RunConclusion::Error => "error",
                    RunConclusion::Stopped => "stopped",
                }),
                ..LifecycleEvent::new("run", "engine")
            },
        );
        driver.assemble(invocation.run_id, conclusion, started)
    }
}

fn plan_issue(err: &PlanError) -> Issue {
    Issue::new("config/plan", Severity::Critical, err.to_string())
}

fn elapsed_ms(started: DateTime<Utc>) -> u64 {
    (Utc::now() - started).num_milliseconds().max(0) as u64
}

// ---------------------------------------------------------------------------
// Run driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ScopeInfo {
    parent: Option<String>,
    /// Step whose fan-out created this scope.
    creator: Option<String>,
    item: Option<Value>,
    depth: u32,
}

struct TaskOutcome {
    step: String,
    scope: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: Result<ProviderOutput, String>,
    timed_out: bool,
}

struct RunDriver<'e> {
    config: Arc<VisorConfig>,
    providers: ProviderRegistry,
    bus: EventBus,
    gate: ControlGate,
    sessions: SessionRegistry,
    options: &'e EngineOptions,
    plan: Plan,
    input: Arc<InvocationInput>,
    depth: u32,
    tag_filter: Option<TagFilter>,

    event_type: String,
    results: HashMap<StepKey, StepResult>,
    scopes: HashMap<String, ScopeInfo>,
    run_counts: HashMap<StepKey, u32>,
    loop_counts: HashMap<String, u32>,
    in_flight: HashSet<StepKey>,
    dynamic: VecDeque<StepKey>,
    on_finish_done: HashSet<StepKey>,
    completion_order: Vec<StepKey>,
    memory: RunMemory,
    fail_fast_triggered: bool,
    internal_error: Option<String>,
}

impl<'e> RunDriver<'e> {
    fn new(engine: &'e Engine, invocation: &Invocation, plan: Plan) -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(
            String::new(),
            ScopeInfo {
                parent: None,
                creator: None,
                item: None,
                depth: 0,
            },
        );
        let mut input = invocation.input.clone();
        input.run_id = invocation.run_id.clone();
        for (key, value) in &engine.inner.config.env {
            input.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Self {
            config: Arc::clone(&engine.inner.config),
            providers: engine.inner.providers.clone(),
            bus: engine.inner.bus.clone(),
            gate: engine.inner.gate.clone(),
            sessions: engine.inner.sessions.clone(),
            options: &engine.inner.options,
            plan,
            event_type: if invocation.input.event_type.is_empty() {
                "all".to_string()
            } else {
                invocation.input.event_type.clone()
            },
            input: Arc::new(input),
            depth: invocation.depth,
            tag_filter: invocation
                .tag_filter
                .clone()
                .or_else(|| engine.inner.options.tag_filter.clone()),
            results: HashMap::new(),
            scopes,
            run_counts: HashMap::new(),
            loop_counts: HashMap::new(),
            in_flight: HashSet::new(),
            dynamic: VecDeque::new(),
            on_finish_done: HashSet::new(),
            completion_order: Vec::new(),
            memory: RunMemory::new(),
            fail_fast_triggered: false,
            internal_error: None,
        }
    }

    async fn drive(&mut self, machine: &mut StateMachine) -> RunConclusion {
        let mut active: JoinSet<TaskOutcome> = JoinSet::new();
        let mut stopped = false;

        loop {
            if self.gate.is_paused() {
                machine.transition(EngineState::Paused);
            }
            match self.gate.wait().await {
                Ok(()) => {
                    if machine.current() == EngineState::Paused {
                        machine.transition(EngineState::Running);
                    }
                }
                Err(Stopped) => {
                    stopped = true;
                }
            }
            if stopped {
                // Running providers finish and their results are recorded.
                while let Some(joined) = active.join_next().await {
                    self.absorb_join(joined);
                }
                return RunConclusion::Stopped;
            }

            if !self.fail_fast_triggered {
                let runnable = self.compute_runnable();
                for (key, gating_skip) in runnable {
                    if let Some(reason) = gating_skip {
                        self.record_skip(&key, reason, None);
                        continue;
                    }
                    if active.len() >= self.options.max_parallelism {
                        break;
                    }
                    self.dispatch(key, &mut active);
                }
            }

            if active.is_empty() {
                if self.fail_fast_triggered {
                    break;
                }
                if self.has_pending_work() {
                    continue;
                }
                if self.process_on_finish() {
                    continue;
                }
                break;
            }

            if let Some(joined) = active.join_next().await {
                self.absorb_join(joined);
            }
        }

        if self.internal_error.is_some() {
            RunConclusion::Error
        } else {
            RunConclusion::Completed
        }
    }

    fn absorb_join(&mut self, joined: Result<TaskOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => self.process_outcome(outcome),
            Err(err) => {
                // A panicking provider task is an internal invariant breach;
                // the invocation still terminates with partial results.
                warn!(error = %err, "provider task panicked");
                self.internal_error = Some(err.to_string());
            }
        }
    }

    /// Skips recorded synchronously can make new work ready immediately.
    fn has_pending_work(&self) -> bool {
        !self.compute_runnable().is_empty()
    }

    // -- readiness ---------------------------------------------------------

    fn compute_runnable(&self) -> Vec<(StepKey, Option<SkipReason>)> {
        let mut out = Vec::new();
        let mut seen: HashSet<StepKey> = HashSet::new();

        for name in &self.plan.order {
            for (scope, gating) in self.target_scopes(name) {
                let key = (name.clone(), scope);
                if self.results.contains_key(&key) || self.in_flight.contains(&key) {
                    continue;
                }
                if seen.insert(key.clone()) {
                    out.push((key, gating));
                }
            }
        }
        for key in &self.dynamic {
            if self.results.contains_key(key) || self.in_flight.contains(key) {
                continue;
            }
            if seen.insert(key.clone()) {
                out.push((key.clone(), None));
            }
        }
        out
    }

    /// Scopes a step should run in right now, with an optional gating skip
    /// when a dependency failed. Empty while dependencies are outstanding.
    fn target_scopes(&self, name: &str) -> Vec<(String, Option<SkipReason>)> {
        let Some(step) = self.config.step(name) else {
            return Vec::new();
        };
        let groups = match self.plan.dep_groups.get(name) {
            Some(groups) if !groups.is_empty() => groups,
            _ => return vec![(String::new(), None)],
        };

        let mut best: Vec<String> = vec![String::new()];
        let mut best_depth = -1i64;
        for group in groups {
            let mut group_scopes: Vec<String> = Vec::new();
            for dep in group {
                let fans_out = self
                    .config
                    .step(dep)
                    .map(|d| d.for_each)
                    .unwrap_or(false);
                if fans_out && step.fanout == FanoutMode::Map {
                    // Child scopes created by the fan-out; a failed fan-out
                    // step gates dependents at its own scope instead.
                    let mut produced = false;
                    for (scope_id, info) in &self.scopes {
                        if info.creator.as_deref() == Some(dep) {
                            group_scopes.push(scope_id.clone());
                            produced = true;
                        }
                    }
                    if !produced {
                        for ((step_name, scope), result) in &self.results {
                            if step_name == dep && result.conclusion.is_failed() {
                                group_scopes.push(scope.clone());
                            }
                        }
                    }
                } else {
                    for ((step_name, scope), _) in &self.results {
                        if step_name == dep {
                            group_scopes.push(scope.clone());
                        }
                    }
                }
            }
            if group_scopes.is_empty() {
                // This dependency group has produced nothing yet.
                return Vec::new();
            }
            let depth = group_scopes
                .iter()
                .map(|s| self.scope_depth(s) as i64)
                .max()
                .unwrap_or(0);
            if depth > best_depth {
                group_scopes.sort();
                group_scopes.dedup();
                best = group_scopes;
                best_depth = depth;
            }
        }

        let mut out = Vec::new();
        for scope in best {
            let mut satisfied = true;
            let mut gated = false;
            for group in groups {
                let mut group_ok = false;
                let mut group_gated = false;
                for dep in group {
                    if self.scope_created_by(&scope, dep) {
                        group_ok = true;
                        break;
                    }
                    if let Some(result) = self.visible_result(dep, &scope) {
                        if result.conclusion.is_failed() && self.gates_dependents(dep) {
                            group_gated = true;
                        } else {
                            group_ok = true;
                            break;
                        }
                    }
                }
                if !group_ok {
                    if group_gated {
                        gated = true;
                    } else {
                        satisfied = false;
                        break;
                    }
                }
            }
            if satisfied {
                out.push((
                    scope,
                    if gated {
                        Some(SkipReason::DependencyFailed)
                    } else {
                        None
                    },
                ));
            }
        }
        out
    }

    fn gates_dependents(&self, dep: &str) -> bool {
        self.config
            .step(dep)
            .and_then(|s| s.continue_on_failure)
            .map(|continue_on_failure| !continue_on_failure)
            .unwrap_or(true)
    }

    fn scope_created_by(&self, scope: &str, step: &str) -> bool {
        let mut current = Some(scope.to_string());
        while let Some(scope_id) = current {
            let Some(info) = self.scopes.get(&scope_id) else {
                break;
            };
            if info.creator.as_deref() == Some(step) {
                return true;
            }
            current = info.parent.clone();
        }
        false
    }

    fn scope_depth(&self, scope: &str) -> u32 {
        self.scopes.get(scope).map(|info| info.depth).unwrap_or(0)
    }

    fn visible_result(&self, step: &str, scope: &str) -> Option<&StepResult> {
        let mut current = Some(scope.to_string());
        while let Some(scope_id) = current {
            if let Some(result) = self.results.get(&(step.to_string(), scope_id.clone())) {
                return Some(result);
            }
            current = self.scopes.get(&scope_id).and_then(|info| info.parent.clone());
        }
        None
    }

    fn bound_item(&self, scope: &str) -> Option<Value> {
        let mut current = Some(scope.to_string());
        while let Some(scope_id) = current {
            let info = self.scopes.get(&scope_id)?;
            if let Some(item) = &info.item {
                return Some(item.clone());
            }
            current = info.parent.clone();
        }
        None
    }

    // -- expression context ------------------------------------------------

    /// Outputs visible from `scope`: nearest result per step walking up the
    /// chain. Inside a fan-out scope the creator step maps to the bound
    /// item; `outputs_raw` always carries the full value.
    fn visible_outputs(&self, scope: &str) -> (Map<String, Value>, Map<String, Value>) {
        let mut processed = Map::new();
        let mut raw = Map::new();

        let mut current = Some(scope.to_string());
        while let Some(scope_id) = current {
            let Some(info) = self.scopes.get(&scope_id) else {
                break;
            };
            if let (Some(creator), Some(item)) = (&info.creator, &info.item) {
                processed
                    .entry(creator.clone())
                    .or_insert_with(|| item.clone());
            }
            current = info.parent.clone();
        }

        for ((step, _), _) in &self.results {
            if raw.contains_key(step) {
                continue;
            }
            if let Some(result) = self.visible_result(step, scope) {
                raw.insert(step.clone(), result.output.clone());
                processed
                    .entry(step.clone())
                    .or_insert_with(|| result.output.clone());
            }
        }
        (processed, raw)
    }

    fn routing_ctx(&self, scope: &str, output: Value, issues: &[Issue]) -> RoutingContext {
        let (outputs, outputs_raw) = self.visible_outputs(scope);
        let mut env = Map::new();
        for (key, value) in &self.input.env {
            env.insert(key.clone(), Value::String(value.clone()));
        }
        RoutingContext {
            output,
            outputs,
            outputs_raw,
            issues: serde_json::to_value(issues).unwrap_or_else(|_| json!([])),
            env,
            memory: self.memory.snapshot(),
            item: self.bound_item(scope),
        }
    }

    // -- dispatch ----------------------------------------------------------

    fn dispatch(&mut self, key: StepKey, active: &mut JoinSet<TaskOutcome>) {
        let (name, scope) = key.clone();
        let Some(step) = self.config.step(&name).cloned() else {
            self.record_failure_now(&key, "step vanished from configuration".to_string());
            return;
        };

        // Tag filter, event filter and preconditions decide skips without
        // consuming the run budget.
        if let Some(filter) = &self.tag_filter {
            if !filter.is_empty() && !filter.matches(&step.tags) {
                self.record_skip(&key, SkipReason::Tag, None);
                return;
            }
        }
        if self.event_type != "all"
            && !step.on.is_empty()
            && !step.on.iter().any(|event| event == &self.event_type)
        {
            self.record_skip(&key, SkipReason::Event, None);
            return;
        }

        let ctx = self.routing_ctx(&scope, Value::Null, &[]);
        match routing::preconditions_hold(&step, &ctx) {
            Ok(PreconditionCheck::Passed) => {}
            Ok(PreconditionCheck::FailedIf) => {
                self.record_skip(&key, SkipReason::Condition, None);
                return;
            }
            Ok(PreconditionCheck::FailedAssume(expression)) => {
                self.record_skip(
                    &key,
                    SkipReason::Assume,
                    Some(Issue::new(
                        "precondition/assume",
                        Severity::Info,
                        format!("assume did not hold: {expression}"),
                    )),
                );
                return;
            }
            Err(err) => {
                // Erroring preconditions skip conservatively.
                self.record_skip(
                    &key,
                    SkipReason::Assume,
                    Some(Issue::new(
                        "precondition/error",
                        Severity::Warning,
                        format!("precondition evaluation failed: {err}"),
                    )),
                );
                return;
            }
        }

        let runs = self.run_counts.get(&key).copied().unwrap_or(0);
        let max_runs = step
            .max_runs
            .unwrap_or(self.options.limits.max_runs_per_check);
        if runs >= max_runs {
            self.record_failure_with_issue(
                &key,
                Issue::new(
                    RULE_BUDGET,
                    Severity::Error,
                    format!("step exceeded max_runs_per_check ({max_runs})"),
                ),
            );
            return;
        }
        self.run_counts.insert(key.clone(), runs + 1);

        self.bus.emit_kind(
            EventKind::CheckScheduled,
            json!({"run_id": self.input.run_id, "step": name, "scope": scope}),
        );

        let deps = self.dependency_outputs(&name, &scope);
        let item = self.bound_item(&scope);
        let session = self.resolve_session(&step);
        let provider = self.providers.resolve(step.step_type);
        let input = Arc::clone(&self.input);
        let memory = self.memory.clone();
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.options.default_step_timeout);
        let depth = self.depth;

        self.in_flight.insert(key);
        self.bus.emit_kind(
            EventKind::CheckStarted,
            json!({"run_id": self.input.run_id, "step": name, "scope": scope}),
        );

        active.spawn(async move {
            let started_at = Utc::now();
            let (outcome, timed_out) = match provider {
                None => (
                    Err(format!(
                        "no provider registered for type '{}'",
                        step.step_type.as_str()
                    )),
                    false,
                ),
                Some(provider) => {
                    let ctx = ExecutionContext {
                        input: &input,
                        step: &step,
                        deps: &deps,
                        item: item.as_ref(),
                        session,
                        memory,
                        depth,
                    };
                    match run_with_timeout(provider, ctx, timeout).await {
                        Ok(output) => (Ok(output), false),
                        Err(TaskError::Provider(message)) => (Err(message), false),
                        Err(TaskError::Timeout(after)) => {
                            (Err(format!("timed out after {after:?}")), true)
                        }
                    }
                }
            };
            TaskOutcome {
                step: name,
                scope,
                started_at,
                finished_at: Utc::now(),
                outcome,
                timed_out,
            }
        });
    }

    fn dependency_outputs(&self, name: &str, scope: &str) -> HashMap<String, Value> {
        let (processed, _) = self.visible_outputs(scope);
        let mut deps = HashMap::new();
        for group in self.plan.dep_groups.get(name).into_iter().flatten() {
            for dep in group {
                if let Some(value) = processed.get(dep) {
                    deps.insert(dep.clone(), value.clone());
                }
            }
        }
        deps
    }

    fn resolve_session(&self, step: &StepConfig) -> Option<SessionHandle> {
        if step.step_type != StepType::Ai {
            return None;
        }
        let Some(reuse) = &step.reuse_ai_session else {
            return Some(self.sessions.session_for(&step.name));
        };
        let source = match reuse {
            ReuseSession::Inherit => self
                .plan
                .dep_groups
                .get(&step.name)
                .and_then(|groups| groups.first())
                .and_then(|group| group.first())
                .cloned(),
            ReuseSession::Named(name) => Some(name.clone()),
        }?;
        if source == step.name {
            // Self-reuse continues the step's own session across runs.
            return Some(self.sessions.session_for(&step.name));
        }
        Some(match step.session_mode.unwrap_or_default() {
            SessionMode::Clone => self.sessions.clone_of(&step.name, &source),
            SessionMode::Append => self.sessions.share_of(&step.name, &source),
        })
    }

    // -- recording ---------------------------------------------------------

    fn record_skip(&mut self, key: &StepKey, reason: SkipReason, issue: Option<Issue>) {
        let now = Utc::now();
        let issues = issue
            .into_iter()
            .map(|i| i.for_step(&key.0, &key.1))
            .collect();
        let result = StepResult {
            step: key.0.clone(),
            scope: key.1.clone(),
            conclusion: StepConclusion::Skipped { reason },
            issues,
            output: Value::Null,
            content: None,
            error: None,
            duration_ms: 0,
            started_at: now,
            finished_at: now,
        };
        self.store_result(key.clone(), result);
        self.bus.emit_kind(
            EventKind::CheckCompleted,
            json!({"run_id": self.input.run_id, "step": key.0, "scope": key.1, "status": "skipped"}),
        );
    }

    fn record_failure_now(&mut self, key: &StepKey, message: String) {
        self.record_failure_with_issue(
            key,
            Issue::new(RULE_PROVIDER, Severity::Error, message),
        );
    }

    /// A failure decided by the engine itself (budget, missing step). No
    /// routing runs from these; the subgraph ends here.
    fn record_failure_with_issue(&mut self, key: &StepKey, issue: Issue) {
        let now = Utc::now();
        let message = issue.message.clone();
        let result = StepResult {
            step: key.0.clone(),
            scope: key.1.clone(),
            conclusion: StepConclusion::Failed,
            issues: vec![issue.for_step(&key.0, &key.1)],
            output: Value::Null,
            content: None,
            error: Some(message),
            duration_ms: 0,
            started_at: now,
            finished_at: now,
        };
        self.store_result(key.clone(), result);
        self.bus.emit_kind(
            EventKind::CheckErrored,
            json!({"run_id": self.input.run_id, "step": key.0, "scope": key.1}),
        );
    }

    fn store_result(&mut self, key: StepKey, result: StepResult) {
        if !self.completion_order.contains(&key) {
            self.completion_order.push(key.clone());
        }
        self.results.insert(key, result);
    }

    // -- outcome processing ------------------------------------------------

    fn process_outcome(&mut self, outcome: TaskOutcome) {
        let TaskOutcome {
            step: step_name,
            scope,
            started_at,
            finished_at,
            outcome: task_result,
            timed_out,
        } = outcome;
        let key = (step_name, scope);
        self.in_flight.remove(&key);
        let Some(step) = self.config.step(&key.0).cloned() else {
            return;
        };
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        match task_result {
            Ok(provider_output) => self.finish_success_path(
                &key,
                &step,
                provider_output,
                started_at,
                finished_at,
                duration_ms,
            ),
            Err(message) => {
                let rule = if timed_out { RULE_TIMEOUT } else { RULE_PROVIDER };
                let issue =
                    Issue::new(rule, Severity::Error, message.clone()).for_step(&key.0, &key.1);
                let result = StepResult {
                    step: key.0.clone(),
                    scope: key.1.clone(),
                    conclusion: StepConclusion::Failed,
                    issues: vec![issue],
                    output: Value::Null,
                    content: None,
                    error: Some(message),
                    duration_ms,
                    started_at,
                    finished_at,
                };
                self.store_result(key.clone(), result);
                self.bus.emit_kind(
                    EventKind::CheckErrored,
                    json!({"run_id": self.input.run_id, "step": key.0, "scope": key.1}),
                );
                self.route_after(&key, &step, false);
                if self.options.fail_fast {
                    self.fail_fast_triggered = true;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_success_path(
        &mut self,
        key: &StepKey,
        step: &StepConfig,
        provider_output: ProviderOutput,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
    ) {
        let mut issues = provider_output.issues;
        let ctx = self.routing_ctx(&key.1, provider_output.output.clone(), &issues);
        let report = contracts::enforce(step, &ctx);
        issues.extend(report.issues);
        let issues: Vec<Issue> = issues
            .into_iter()
            .map(|issue| {
                if issue.step.is_none() {
                    issue.for_step(&key.0, &key.1)
                } else {
                    issue
                }
            })
            .collect();

        let failed = report.failed;
        let result = StepResult {
            step: key.0.clone(),
            scope: key.1.clone(),
            conclusion: if failed {
                StepConclusion::Failed
            } else {
                StepConclusion::Success
            },
            issues,
            output: provider_output.output.clone(),
            content: provider_output.content,
            error: None,
            duration_ms,
            started_at,
            finished_at,
        };
        self.store_result(key.clone(), result);

        if !failed && step.for_each {
            self.create_fanout_scopes(key, &provider_output.output);
        }

        self.bus.emit_kind(
            if failed {
                EventKind::CheckErrored
            } else {
                EventKind::CheckCompleted
            },
            json!({
                "run_id": self.input.run_id,
                "step": key.0,
                "scope": key.1,
                "status": if failed { "failed" } else { "success" },
            }),
        );

        self.route_after(key, step, !failed);
        if failed && self.options.fail_fast {
            self.fail_fast_triggered = true;
        }
    }

    fn create_fanout_scopes(&mut self, key: &StepKey, output: &Value) {
        let items: Vec<Value> = match output {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        let parent_depth = self.scope_depth(&key.1);
        for (index, item) in items.into_iter().enumerate() {
            let scope_id = if key.1.is_empty() {
                format!("{}[{}]", key.0, index)
            } else {
                format!("{}/{}[{}]", key.1, key.0, index)
            };
            self.scopes.insert(
                scope_id,
                ScopeInfo {
                    parent: Some(key.1.clone()),
                    creator: Some(key.0.clone()),
                    item: Some(item),
                    depth: parent_depth + 1,
                },
            );
        }
    }

    // -- routing -----------------------------------------------------------

    fn route_after(&mut self, key: &StepKey, step: &StepConfig, success: bool) {
        let block = if success {
            step.on_success.as_ref()
        } else {
            step.on_fail.as_ref()
        };
        let Some(block) = block else {
            return;
        };
        self.evaluate_and_apply(key, step, block);
    }

    fn evaluate_and_apply(&mut self, key: &StepKey, step: &StepConfig, block: &TransitionBlock) {
        let result_output = self
            .results
            .get(key)
            .map(|r| r.output.clone())
            .unwrap_or(Value::Null);
        let result_issues: Vec<Issue> = self
            .results
            .get(key)
            .map(|r| r.issues.clone())
            .unwrap_or_default();
        let ctx = self.routing_ctx(&key.1, result_output, &result_issues);
        match routing::evaluate_block(block, &ctx) {
            Ok(intent) => {
                self.apply_intent(key, step, intent);
            }
            Err(err) => {
                self.append_issue(
                    key,
                    Issue::new(
                        RULE_ROUTING,
                        Severity::Error,
                        format!("transition evaluation failed: {err}"),
                    ),
                );
            }
        }
    }

    fn apply_intent(&mut self, key: &StepKey, step: &StepConfig, intent: RoutingIntent) -> bool {
        match intent {
            RoutingIntent::None => false,
            RoutingIntent::Goto { to, event } => {
                let valid = self.plan.contains(&to)
                    && (to == step.name || self.plan.ancestors(&step.name).contains(&to));
                if !valid {
                    self.append_issue(
                        key,
                        Issue::new(
                            RULE_ROUTING,
                            Severity::Error,
                            format!("goto target '{to}' is not an ancestor of '{}'", step.name),
                        ),
                    );
                    return false;
                }
                if !self.consume_loop_budget(key) {
                    return false;
                }
                if let Some(event) = event {
                    self.event_type = event;
                }
                self.clear_for_goto(&to, &key.1);
                true
            }
            RoutingIntent::Run { steps } => {
                if steps.is_empty() {
                    return false;
                }
                if !self.consume_loop_budget(key) {
                    return false;
                }
                let mut scheduled = false;
                for name in steps {
                    if self.config.step(&name).is_none() {
                        self.append_issue(
                            key,
                            Issue::new(
                                RULE_ROUTING,
                                Severity::Error,
                                format!("post-step '{name}' does not exist"),
                            ),
                        );
                        continue;
                    }
                    let target = (name, key.1.clone());
                    self.results.remove(&target);
                    self.dynamic.push_back(target);
                    scheduled = true;
                }
                scheduled
            }
        }
    }

    /// Budgets are enforced before dispatching a transition: once a scope
    /// exhausts `routing.max_loops`, further transitions are refused with a
    /// budget issue on the offending step.
    fn consume_loop_budget(&mut self, key: &StepKey) -> bool {
        let loops = self.loop_counts.entry(key.1.clone()).or_insert(0);
        if *loops >= self.options.routing.max_loops {
            self.append_issue(
                key,
                Issue::new(
                    RULE_BUDGET,
                    Severity::Error,
                    format!(
                        "routing budget exhausted in scope '{}' (max_loops {})",
                        key.1, self.options.routing.max_loops
                    ),
                ),
            );
            return false;
        }
        *loops += 1;
        true
    }

    fn clear_for_goto(&mut self, target: &str, scope: &str) {
        let steps_to_clear = self.plan.subtree(target);

        let family: Vec<String> = self
            .scopes
            .keys()
            .filter(|candidate| self.scope_in_family(candidate, scope))
            .cloned()
            .collect();

        self.results.retain(|(step, result_scope), _| {
            !(steps_to_clear.contains(step) && family.contains(result_scope))
        });
        self.on_finish_done
            .retain(|(step, done_scope)| {
                !(steps_to_clear.contains(step) && family.contains(done_scope))
            });
        self.dynamic.retain(|(step, dyn_scope)| {
            !(steps_to_clear.contains(step) && family.contains(dyn_scope))
        });
        // Scopes fanned out by a cleared step are recreated on re-run.
        self.scopes.retain(|_, info| {
            info.creator
                .as_ref()
                .map(|creator| {
                    !(steps_to_clear.contains(creator)
                        && info
                            .parent
                            .as_ref()
                            .map(|parent| family.contains(parent))
                            .unwrap_or(false))
                })
                .unwrap_or(true)
        });
        debug!(target, scope, "rewound subgraph for goto");
    }

    fn scope_in_family(&self, candidate: &str, root: &str) -> bool {
        let mut current = Some(candidate.to_string());
        while let Some(scope_id) = current {
            if scope_id == root {
                return true;
            }
            current = self.scopes.get(&scope_id).and_then(|i| i.parent.clone());
        }
        false
    }

    fn append_issue(&mut self, key: &StepKey, issue: Issue) {
        let issue = issue.for_step(&key.0, &key.1);
        if let Some(result) = self.results.get_mut(key) {
            result.issues.push(issue);
        }
    }

    // -- on_finish ---------------------------------------------------------

    /// After the run quiesces, `on_finish` blocks of completed fan-out
    /// steps run exactly once. Returns true when new work was produced.
    fn process_on_finish(&mut self) -> bool {
        let candidates: Vec<StepKey> = self
            .results
            .iter()
            .filter_map(|(key, result)| {
                let step = self.config.step(&key.0)?;
                if step.for_each
                    && step.on_finish.is_some()
                    && result.conclusion.is_success()
                    && !self.on_finish_done.contains(key)
                {
                    Some(key.clone())
                } else {
                    None
                }
            })
            .collect();

        let mut produced = false;
        for key in candidates {
            self.on_finish_done.insert(key.clone());
            let Some(step) = self.config.step(&key.0).cloned() else {
                continue;
            };
            let Some(block) = step.on_finish.clone() else {
                continue;
            };
            let result_output = self
                .results
                .get(&key)
                .map(|r| r.output.clone())
                .unwrap_or(Value::Null);
            let ctx = self.routing_ctx(&key.1, result_output, &[]);
            match routing::evaluate_block(&block, &ctx) {
                Ok(intent) => {
                    if self.apply_intent(&key, &step, intent) {
                        produced = true;
                    }
                }
                Err(err) => self.append_issue(
                    &key,
                    Issue::new(
                        RULE_ROUTING,
                        Severity::Error,
                        format!("on_finish evaluation failed: {err}"),
                    ),
                ),
            }
        }
        produced
    }

    // -- assembly ----------------------------------------------------------

    fn assemble(
        &self,
        run_id: String,
        conclusion: RunConclusion,
        started: DateTime<Utc>,
    ) -> GroupedResults {
        let mut groups: BTreeMap<String, Vec<StepResult>> = BTreeMap::new();
        for root in &self.plan.roots {
            groups.entry(root.clone()).or_default();
        }

        let root_of: HashMap<String, String> = {
            let mut map = HashMap::new();
            for root in &self.plan.roots {
                let members = self.plan.ancestors(root);
                map.entry(root.clone()).or_insert_with(|| root.clone());
                for member in members {
                    map.entry(member).or_insert_with(|| root.clone());
                }
            }
            map
        };

        let mut pushed: HashSet<&StepKey> = HashSet::new();
        for key in &self.completion_order {
            if !pushed.insert(key) {
                continue;
            }
            let Some(result) = self.results.get(key) else {
                continue;
            };
            let group = root_of
                .get(&key.0)
                .cloned()
                .unwrap_or_else(|| key.0.clone());
            groups.entry(group).or_default().push(result.clone());
        }

        let mut run_issues = Vec::new();
        if let Some(internal) = &self.internal_error {
            run_issues.push(Issue::new(
                "engine/internal",
                Severity::Critical,
                internal.clone(),
            ));
        }
        if let Some(fail_if) = &self.options.run_fail_if {
            let ctx = self.routing_ctx("", Value::Null, &[]);
            match crate::expr::evaluate_truthy(fail_if, &ctx.scope()) {
                Ok(true) => run_issues.push(Issue::new(
                    RULE_RUN_FAIL_IF,
                    Severity::Critical,
                    format!("run failure condition held: {fail_if}"),
                )),
                Ok(false) => {}
                Err(err) => run_issues.push(Issue::new(
                    RULE_RUN_FAIL_IF,
                    Severity::Warning,
                    format!("run failure condition errored: {err}"),
                )),
            }
        }

        GroupedResults {
            run_id,
            conclusion,
            groups,
            run_issues,
            duration_ms: elapsed_ms(started),
        }
    }
}

enum TaskError {
    Provider(String),
    Timeout(Duration),
}

async fn run_with_timeout(
    provider: Arc<dyn Provider>,
    ctx: ExecutionContext<'_>,
    timeout: Option<Duration>,
) -> Result<ProviderOutput, TaskError> {
    match timeout {
        None => provider
            .execute(ctx)
            .await
            .map_err(|err| TaskError::Provider(format!("{err:#}"))),
        Some(limit) => match tokio::time::timeout(limit, provider.execute(ctx)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(TaskError::Provider(format!("{err:#}"))),
            Err(_) => Err(TaskError::Timeout(limit)),
        },
    }
}

// ---------------------------------------------------------------------------
// Workflow provider — nested invocations through the engine itself
// ---------------------------------------------------------------------------

/// Runs a named step subgraph as a nested invocation. The engine enforces
/// `max_workflow_depth` on entry, so runaway nesting terminates with a
/// budget error instead of recursion.
pub struct WorkflowProvider {
    engine: parking_lot::Mutex<Option<Engine>>,
}

impl WorkflowProvider {
    pub fn new() -> Self {
        Self {
            engine: parking_lot::Mutex::new(None),
        }
    }

    pub fn wire(&self, engine: Engine) {
        *self.engine.lock() = Some(engine);
    }
}

impl Default for WorkflowProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for WorkflowProvider {
    fn kind(&self) -> StepType {
        StepType::Workflow
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ProviderOutput> {
        let engine = self
            .engine
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("workflow provider is not wired to an engine"))?;
        let content = ctx.step.content.clone().unwrap_or_else(|| json!({}));
        let target = content["workflow"]
            .as_str()
            .ok_or_else(|| {
                anyhow::anyhow!("workflow step '{}' names no workflow", ctx.step.name)
            })?
            .to_string();

        let mut input = ctx.input.clone();
        input.run_id = format!("{}::{}", ctx.input.run_id, ctx.step.name);
        if let Some(inputs) = content.get("inputs") {
            input.payload = inputs.clone();
        }
        let mut invocation = Invocation::new(vec![target], input);
        invocation.depth = ctx.depth + 1;

        let results = engine.run(invocation).await;
        let issues: Vec<Issue> = results.issues().into_iter().cloned().collect();
        match results.conclusion {
            RunConclusion::Completed => {
                let mut outputs = Map::new();
                for result in results.all_results() {
                    if result.scope.is_empty() {
                        outputs.insert(result.step.clone(), result.output.clone());
                    }
                }
                Ok(ProviderOutput {
                    issues,
                    output: Value::Object(outputs),
                    content: None,
                    debug: None,
                })
            }
            RunConclusion::Error => anyhow::bail!(
                "nested workflow failed: {}",
                issues
                    .first()
                    .map(|issue| issue.message.clone())
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
            RunConclusion::Stopped => anyhow::bail!("nested workflow was stopped"),
        }
    }
}
