//! The scheduler daemon: fires static cron jobs and dynamic schedules
//! through a [`ScheduleExecutor`], guaranteeing at-most-once execution per
//! fire across nodes when HA locking is enabled.
//!
//! Per-schedule timer tasks do the precise firing; a periodic due-check
//! sweeps up anything a timer missed (wake-from-sleep, clock jumps).
//! Scheduler faults never crash the daemon: they are logged per schedule
//! and the offending schedule is paused or failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use visor_types::{
    HaConfig, OutputKind, Schedule, ScheduleOutcome, ScheduleStatus, StaticCronJob,
};

use crate::cron;
use crate::store::{LockToken, ScheduleStore};

/// Consecutive failures before a schedule is marked `failed` and its local
/// cron task is stopped.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Executes the workflow behind a schedule. The host wires this to the
/// engine; tests substitute canned outcomes.
#[async_trait]
pub trait ScheduleExecutor: Send + Sync {
    async fn execute(&self, schedule: &Schedule) -> anyhow::Result<ScheduleOutcome>;
}

/// Receives `(schedule, outcome)` after each fire. The only channel by
/// which results leave the scheduler; delivery errors are swallowed.
#[async_trait]
pub trait OutputAdapter: Send + Sync {
    async fn deliver(&self, schedule: &Schedule, outcome: &ScheduleOutcome) -> anyhow::Result<()>;
}

/// Discards results; the default for schedules without an output target.
pub struct NoneAdapter;

#[async_trait]
impl OutputAdapter for NoneAdapter {
    async fn deliver(&self, _schedule: &Schedule, _outcome: &ScheduleOutcome) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub node_id: String,
    pub check_interval: StdDuration,
    pub ha: HaConfig,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            node_id: format!("visor-{}", Uuid::new_v4()),
            check_interval: StdDuration::from_secs(30),
            ha: HaConfig::default(),
        }
    }
}

struct SchedulerInner {
    store: Arc<ScheduleStore>,
    executor: Arc<dyn ScheduleExecutor>,
    adapters: Mutex<HashMap<OutputKind, Arc<dyn OutputAdapter>>>,
    options: SchedulerOptions,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Locks held for fires currently in progress.
    held_locks: Mutex<HashMap<String, LockToken>>,
    /// Local at-most-once guard: ids with a fire in flight on this node.
    in_flight: Mutex<std::collections::HashSet<String>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<ScheduleStore>,
        executor: Arc<dyn ScheduleExecutor>,
        options: SchedulerOptions,
    ) -> Self {
        let adapters: HashMap<OutputKind, Arc<dyn OutputAdapter>> =
            HashMap::from([(OutputKind::None, Arc::new(NoneAdapter) as Arc<dyn OutputAdapter>)]);
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                executor,
                adapters: Mutex::new(adapters),
                options,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(HashMap::new()),
                held_locks: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(std::collections::HashSet::new()),
            }),
        }
    }

    pub fn register_adapter(&self, kind: OutputKind, adapter: Arc<dyn OutputAdapter>) {
        self.inner.adapters.lock().insert(kind, adapter);
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.inner.store
    }

    /// Register static cron jobs, hydrate dynamic schedules from the store
    /// and start the safety-net due-check plus the HA heartbeat.
    pub async fn start(&self, static_jobs: &[StaticCronJob]) -> anyhow::Result<()> {
        for job in static_jobs {
            if !job.enabled {
                continue;
            }
            if let Err(err) = cron::validate(&job.cron) {
                error!(step = %job.step, error = %err, "static cron job has an invalid expression; skipping");
                continue;
            }
            self.spawn_static_job(job.clone());
        }

        let active = self.inner.store.get_active().await?;
        for schedule in active {
            self.hydrate(schedule).await;
        }

        self.spawn_due_check();
        if self.inner.options.ha.enabled {
            self.spawn_heartbeat();
        }
        info!(node = %self.inner.options.node_id, "scheduler started");
        Ok(())
    }

    /// Stop timers, cancel the heartbeat and release every held lock.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut map = self.inner.tasks.lock();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for task in tasks {
            task.abort();
        }
        let held: Vec<(String, LockToken)> = {
            let mut map = self.inner.held_locks.lock();
            map.drain().collect()
        };
        for (schedule_id, token) in held {
            if let Err(err) = self.inner.store.release_lock(&schedule_id, &token).await {
                warn!(schedule_id = %schedule_id, error = %err, "failed to release lock on stop");
            }
        }
        info!(node = %self.inner.options.node_id, "scheduler stopped");
    }

    // -- hydration ---------------------------------------------------------

    async fn hydrate(&self, schedule: Schedule) {
        if schedule.is_one_shot() {
            let Some(run_at) = schedule.run_at else {
                return;
            };
            let id = schedule.id.clone();
            let delay = (run_at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
            if delay.is_zero() {
                debug!(schedule_id = %id, "one-shot past due at hydration; firing now");
            }
            self.spawn_one_shot(id, delay);
        } else if let Some(expr) = schedule.cron.clone() {
            if let Err(err) = cron::validate(&expr) {
                error!(schedule_id = %schedule.id, error = %err, "dynamic schedule has an invalid cron; pausing");
                let _ = self
                    .inner
                    .store
                    .update(&schedule.id, |s| {
                        s.status = ScheduleStatus::Paused;
                        s.last_error = Some(err.to_string());
                    })
                    .await;
                return;
            }
            // Backfill next_run_at for rows created before this node start.
            if schedule.next_run_at.is_none() {
                let next = cron::next_after(&expr, Utc::now(), &schedule.timezone)
                    .ok()
                    .flatten();
                let _ = self
                    .inner
                    .store
                    .update(&schedule.id, |s| s.next_run_at = next)
                    .await;
            }
            self.spawn_recurring(schedule.id.clone());
        }
    }

    fn spawn_static_job(&self, job: StaticCronJob) {
        let this = self.clone();
        let key = format!("static:{}", job.step);
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let tz = job.timezone.as_deref().unwrap_or("UTC");
                let next = match cron::next_after(&job.cron, now, tz) {
                    Ok(Some(next)) => next,
                    _ => {
                        warn!(step = %job.step, "static cron has no next occurrence; task ends");
                        return;
                    }
                };
                let delay = (next - now).to_std().unwrap_or(StdDuration::ZERO);
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                this.execute_static_cron_job(&job).await;
            }
        });
        self.inner.tasks.lock().insert(key, handle);
    }

    async fn execute_static_cron_job(&self, job: &StaticCronJob) {
        // Static jobs are fired through an ephemeral schedule so the
        // executor and adapters see one uniform shape.
        let mut synthetic = Schedule::recurring(job.cron.clone());
        synthetic.id = format!("static:{}", job.step);
        synthetic.workflow = Some(job.step.clone());
        if let Some(tz) = &job.timezone {
            synthetic.timezone = tz.clone();
        }
        match self.inner.executor.execute(&synthetic).await {
            Ok(outcome) => {
                self.deliver(&synthetic, &outcome).await;
            }
            Err(err) => {
                error!(step = %job.step, error = %err, "static cron job failed");
            }
        }
    }

    fn spawn_one_shot(&self, schedule_id: String, delay: StdDuration) {
        let this = self.clone();
        let key = format!("oneshot:{schedule_id}");
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = this.inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            this.fire(&schedule_id).await;
        });
        self.inner.tasks.lock().insert(key, handle);
    }

    fn spawn_recurring(&self, schedule_id: String) {
        let this = self.clone();
        let key = format!("cron:{schedule_id}");
        let handle = tokio::spawn(async move {
            loop {
                let Ok(Some(schedule)) = this.inner.store.get(&schedule_id).await else {
                    return;
                };
                if schedule.status != ScheduleStatus::Active {
                    return;
                }
                let now = Utc::now();
                let next = match schedule.next_run_at {
                    Some(next) if next > now => next,
                    Some(_) => now,
                    None => return,
                };
                let delay = (next - now).to_std().unwrap_or(StdDuration::ZERO);
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                this.fire(&schedule_id).await;
                // Pacing floor: a lock-skipped fire leaves next_run_at in
                // the past until the winning node advances it.
                tokio::time::sleep(StdDuration::from_millis(500)).await;
            }
        });
        self.inner.tasks.lock().insert(key, handle);
    }

    fn spawn_due_check(&self) {
        let this = self.clone();
        let interval = self.inner.options.check_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let due = match this.inner.store.get_due(Utc::now()).await {
                    Ok(due) => due,
                    Err(err) => {
                        warn!(error = %err, "due check failed");
                        continue;
                    }
                };
                for schedule in due {
                    this.fire(&schedule.id).await;
                }
            }
        });
        self.inner.tasks.lock().insert("due-check".to_string(), handle);
    }

    fn spawn_heartbeat(&self) {
        let this = self.clone();
        // Tick at the configured heartbeat, never slower than half the TTL,
        // so a healthy node cannot lose its locks between renewals.
        let interval = StdDuration::from_secs(
            self.inner
                .options
                .ha
                .heartbeat_interval_sec
                .max(1)
                .min(self.inner.options.ha.lock_ttl_sec.max(2) / 2),
        );
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let held: Vec<(String, LockToken)> = this
                    .inner
                    .held_locks
                    .lock()
                    .iter()
                    .map(|(id, token)| (id.clone(), token.clone()))
                    .collect();
                for (schedule_id, token) in held {
                    let renewed = this
                        .inner
                        .store
                        .renew_lock(&schedule_id, &token, this.inner.options.ha.lock_ttl_sec)
                        .await
                        .unwrap_or(false);
                    if !renewed {
                        warn!(schedule_id = %schedule_id, "lock renewal failed; dropping locally");
                        this.inner.held_locks.lock().remove(&schedule_id);
                    }
                }
            }
        });
        self.inner
            .tasks
            .lock()
            .insert("heartbeat".to_string(), handle);
    }

    // -- firing ------------------------------------------------------------

    /// Fire one schedule if it is still active and due. Public so the CLI
    /// (`schedule create --force`) and tests can trigger immediately.
    pub async fn fire(&self, schedule_id: &str) {
        if !self.inner.in_flight.lock().insert(schedule_id.to_string()) {
            return;
        }
        self.fire_guarded(schedule_id).await;
        self.inner.in_flight.lock().remove(schedule_id);
    }

    async fn fire_guarded(&self, schedule_id: &str) {
        let schedule = match self.inner.store.get(schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return,
            Err(err) => {
                warn!(schedule_id = %schedule_id, error = %err, "failed to load schedule");
                return;
            }
        };
        if schedule.status != ScheduleStatus::Active {
            return;
        }

        let lock = if self.inner.options.ha.enabled {
            match self
                .inner
                .store
                .try_acquire_lock(
                    schedule_id,
                    &self.inner.options.node_id,
                    self.inner.options.ha.lock_ttl_sec,
                )
                .await
            {
                Ok(Some(token)) => {
                    self.inner
                        .held_locks
                        .lock()
                        .insert(schedule_id.to_string(), token.clone());
                    Some(token)
                }
                Ok(None) => {
                    debug!(schedule_id = %schedule_id, "another node holds the lock; skipping fire");
                    return;
                }
                Err(err) => {
                    warn!(schedule_id = %schedule_id, error = %err, "lock acquisition failed");
                    return;
                }
            }
        } else {
            None
        };

        let outcome = match self.inner.executor.execute(&schedule).await {
            Ok(outcome) => outcome,
            Err(err) => ScheduleOutcome {
                success: false,
                output: json!(null),
                error: Some(format!("{err:#}")),
            },
        };

        if outcome.success {
            self.record_success(&schedule).await;
        } else {
            self.record_failure(&schedule, outcome.error.as_deref()).await;
        }
        self.deliver(&schedule, &outcome).await;

        if let Some(token) = lock {
            self.inner.held_locks.lock().remove(schedule_id);
            if let Err(err) = self.inner.store.release_lock(schedule_id, &token).await {
                warn!(schedule_id = %schedule_id, error = %err, "lock release failed");
            }
        }
    }

    async fn record_success(&self, schedule: &Schedule) {
        let now = Utc::now();
        if schedule.is_one_shot() {
            // One-shot lifecycle: active → completed → deleted.
            let _ = self
                .inner
                .store
                .update(&schedule.id, |s| {
                    s.status = ScheduleStatus::Completed;
                    s.run_count += 1;
                    s.failure_count = 0;
                    s.last_run_at = Some(now);
                    s.next_run_at = None;
                })
                .await;
            if let Err(err) = self.inner.store.delete(&schedule.id).await {
                warn!(schedule_id = %schedule.id, error = %err, "failed to delete completed one-shot");
            }
            return;
        }

        let next = schedule
            .cron
            .as_deref()
            .and_then(|expr| cron::next_after(expr, now, &schedule.timezone).ok().flatten());
        let paused = next.is_none();
        let update = self
            .inner
            .store
            .update(&schedule.id, |s| {
                s.run_count += 1;
                s.failure_count = 0;
                s.last_run_at = Some(now);
                s.next_run_at = next;
                if paused {
                    s.status = ScheduleStatus::Paused;
                    s.last_error = Some("no further cron occurrence".to_string());
                }
            })
            .await;
        if let Err(err) = update {
            warn!(schedule_id = %schedule.id, error = %err, "failed to record success");
        }
    }

    async fn record_failure(&self, schedule: &Schedule, error: Option<&str>) {
        let now = Utc::now();
        let failures = schedule.failure_count + 1;
        let fatal = failures >= MAX_CONSECUTIVE_FAILURES;
        let next = if schedule.is_one_shot() {
            None
        } else {
            schedule
                .cron
                .as_deref()
                .and_then(|expr| cron::next_after(expr, now, &schedule.timezone).ok().flatten())
        };
        let update = self
            .inner
            .store
            .update(&schedule.id, |s| {
                s.failure_count = failures;
                s.last_run_at = Some(now);
                s.last_error = error.map(str::to_string);
                s.next_run_at = next;
                if fatal {
                    s.status = ScheduleStatus::Failed;
                }
            })
            .await;
        if let Err(err) = update {
            warn!(schedule_id = %schedule.id, error = %err, "failed to record failure");
        }
        if fatal {
            // Stop the local cron task; further ticks must not execute.
            let key = format!("cron:{}", schedule.id);
            if let Some(task) = self.inner.tasks.lock().remove(&key) {
                task.abort();
            }
            error!(schedule_id = %schedule.id, failures, "schedule failed after repeated errors");
        }
    }

    async fn deliver(&self, schedule: &Schedule, outcome: &ScheduleOutcome) {
        let adapter = self.inner.adapters.lock().get(&schedule.output.kind).cloned();
        let Some(adapter) = adapter else {
            debug!(schedule_id = %schedule.id, kind = ?schedule.output.kind, "no adapter registered");
            return;
        };
        if let Err(err) = adapter.deliver(schedule, outcome).await {
            // Adapter faults are logged and swallowed.
            warn!(schedule_id = %schedule.id, error = %err, "output adapter failed");
        }
    }

    /// Register timers for a schedule created after start-up.
    pub async fn track(&self, schedule: Schedule) {
        self.hydrate(schedule).await;
    }
}
