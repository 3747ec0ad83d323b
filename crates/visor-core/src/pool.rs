//! Bounded concurrent executor with a priority queue, per-task timeout,
//! graceful shutdown and dynamic resize.
//!
//! `submit` never throws: a full queue or a shutting-down pool returns
//! `false` and bumps the rejection counter. Tasks race a per-item timeout;
//! timeouts are failures with a marker. The pool never retries.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
    pub task_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub graceful_shutdown: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 100,
            task_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            graceful_shutdown: true,
        }
    }
}

/// One unit of queued work. Ordering is priority-descending, FIFO within
/// equal priority.
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    pub id: String,
    pub data: T,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl<T> WorkItem<T> {
    pub fn new(data: T, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data,
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    WorkSubmitted { id: String },
    WorkCompleted { id: String, worker: usize },
    WorkFailed { id: String, worker: usize, error: String, timed_out: bool },
    QueueFull { id: String },
    Idle,
    Shutdown,
    Resized { size: usize },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_error: Option<String>,
    pub busy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub queue_len: usize,
    pub busy_workers: usize,
    pub total_submitted: u64,
    pub total_rejected: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub workers: Vec<(usize, WorkerStats)>,
}

struct Prioritized<T> {
    item: WorkItem<T>,
    seq: u64,
}

impl<T> PartialEq for Prioritized<T> {
    fn eq(&self, other: &Self) -> bool {
        self.item.priority == other.item.priority && self.seq == other.seq
    }
}

impl<T> Eq for Prioritized<T> {}

impl<T> PartialOrd for Prioritized<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Prioritized<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.item
            .priority
            .cmp(&other.item.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

type TaskFn<T> = Arc<dyn Fn(WorkItem<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct PoolShared<T> {
    task: TaskFn<T>,
    queue: Mutex<QueueState<T>>,
    stats: Mutex<StatsState>,
    notify: Notify,
    events: broadcast::Sender<PoolEvent>,
    shutting_down: AtomicBool,
    target_size: AtomicUsize,
    task_timeout: Duration,
}

struct QueueState<T> {
    heap: BinaryHeap<Prioritized<T>>,
    capacity: usize,
    next_seq: u64,
}

#[derive(Default)]
struct StatsState {
    total_submitted: u64,
    total_rejected: u64,
    total_completed: u64,
    total_failed: u64,
    workers: HashMap<usize, WorkerStats>,
}

pub struct WorkerPool<T> {
    shared: Arc<PoolShared<T>>,
    config: PoolConfig,
    handles: Mutex<HashMap<usize, JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(config: PoolConfig, task: F) -> Self
    where
        F: Fn(WorkItem<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(PoolShared {
            task: Arc::new(task),
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                capacity: config.queue_capacity,
                next_seq: 0,
            }),
            stats: Mutex::new(StatsState::default()),
            notify: Notify::new(),
            events,
            shutting_down: AtomicBool::new(false),
            target_size: AtomicUsize::new(config.pool_size),
            task_timeout: config.task_timeout,
        });
        let pool = Self {
            shared,
            config,
            handles: Mutex::new(HashMap::new()),
            next_worker_id: AtomicUsize::new(0),
        };
        for _ in 0..pool.config.pool_size {
            pool.spawn_worker();
        }
        pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Enqueue work. Returns `false` without blocking when the queue is at
    /// capacity or the pool is shutting down.
    pub fn submit(&self, item: WorkItem<T>) -> bool {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            self.shared.stats.lock().total_rejected += 1;
            let _ = self.shared.events.send(PoolEvent::QueueFull { id: item.id });
            return false;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.heap.len() >= queue.capacity {
                drop(queue);
                self.shared.stats.lock().total_rejected += 1;
                let _ = self.shared.events.send(PoolEvent::QueueFull { id: item.id });
                return false;
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            let id = item.id.clone();
            queue.heap.push(Prioritized { item, seq });
            self.shared.stats.lock().total_submitted += 1;
            let _ = self.shared.events.send(PoolEvent::WorkSubmitted { id });
        }
        self.shared.notify.notify_one();
        true
    }

    pub fn status(&self) -> PoolStatus {
        let queue_len = self.shared.queue.lock().heap.len();
        let stats = self.shared.stats.lock();
        let mut workers: Vec<(usize, WorkerStats)> = stats
            .workers
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        workers.sort_by_key(|(id, _)| *id);
        PoolStatus {
            pool_size: self.shared.target_size.load(Ordering::SeqCst),
            queue_len,
            busy_workers: workers.iter().filter(|(_, s)| s.busy).count(),
            total_submitted: stats.total_submitted,
            total_rejected: stats.total_rejected,
            total_completed: stats.total_completed,
            total_failed: stats.total_failed,
            workers,
        }
    }

    /// Change the number of logical workers. Growing spawns idle workers and
    /// kicks processing; shrinking retires workers as they go idle, waiting
    /// up to the shutdown timeout for busy ones.
    pub async fn resize(&self, new_size: usize) {
        let old = self.shared.target_size.swap(new_size, Ordering::SeqCst);
        if new_size > old {
            for _ in old..new_size {
                self.spawn_worker();
            }
            self.shared.notify.notify_waiters();
        } else if new_size < old {
            self.shared.notify.notify_waiters();
            let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
            loop {
                let alive = self.shared.stats.lock().workers.len();
                if alive <= new_size || tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        let _ = self.shared.events.send(PoolEvent::Resized { size: new_size });
    }

    /// Stop accepting work; with graceful shutdown, wait up to the shutdown
    /// timeout for busy workers to drain. Queued items are discarded.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();

        if self.config.graceful_shutdown {
            let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
            loop {
                let busy = {
                    let stats = self.shared.stats.lock();
                    stats.workers.values().any(|w| w.busy)
                };
                if !busy || tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        let discarded = {
            let mut queue = self.shared.queue.lock();
            let n = queue.heap.len();
            queue.heap.clear();
            n
        };
        if discarded > 0 {
            debug!(discarded, "discarded queued work on shutdown");
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut map = self.handles.lock();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
        let _ = self.shared.events.send(PoolEvent::Shutdown);
    }

    fn spawn_worker(&self) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        self.shared
            .stats
            .lock()
            .workers
            .insert(worker_id, WorkerStats::default());
        let handle = tokio::spawn(worker_loop(worker_id, shared));
        self.handles.lock().insert(worker_id, handle);
    }
}

async fn worker_loop<T: Send + 'static>(worker_id: usize, shared: Arc<PoolShared<T>>) {
    loop {
        if shared.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        // Retire while the live worker set exceeds the target size. The
        // stats lock serializes candidates so exactly enough workers leave.
        {
            let mut stats = shared.stats.lock();
            if stats.workers.len() > shared.target_size.load(Ordering::SeqCst) {
                stats.workers.remove(&worker_id);
                break;
            }
        }

        let next = shared.queue.lock().heap.pop();
        let Some(Prioritized { item, .. }) = next else {
            let notified = shared.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
            continue;
        };

        let item_id = item.id.clone();
        set_busy(&shared, worker_id, true);
        let outcome = tokio::time::timeout(shared.task_timeout, (shared.task)(item)).await;
        set_busy(&shared, worker_id, false);

        let mut stats = shared.stats.lock();
        let worker = stats.workers.entry(worker_id).or_default();
        worker.completed += 1;
        match outcome {
            Ok(Ok(())) => {
                worker.succeeded += 1;
                drop(stats);
                bump_completed(&shared);
                let _ = shared.events.send(PoolEvent::WorkCompleted {
                    id: item_id,
                    worker: worker_id,
                });
            }
            Ok(Err(error)) => {
                worker.failed += 1;
                worker.last_error = Some(error.to_string());
                drop(stats);
                bump_failed(&shared);
                let _ = shared.events.send(PoolEvent::WorkFailed {
                    id: item_id,
                    worker: worker_id,
                    error: error.to_string(),
                    timed_out: false,
                });
            }
            Err(_) => {
                worker.failed += 1;
                worker.last_error = Some("task timed out".to_string());
                drop(stats);
                bump_failed(&shared);
                warn!(worker = worker_id, id = %item_id, "task timed out");
                let _ = shared.events.send(PoolEvent::WorkFailed {
                    id: item_id,
                    worker: worker_id,
                    error: "task timed out".to_string(),
                    timed_out: true,
                });
            }
        }

        let idle = {
            let queue_empty = shared.queue.lock().heap.is_empty();
            queue_empty && !shared.stats.lock().workers.values().any(|w| w.busy)
        };
        if idle {
            let _ = shared.events.send(PoolEvent::Idle);
        }
    }
    // Drop this worker's registration so resize/shutdown observe the exit.
    shared.stats.lock().workers.remove(&worker_id);
}

fn set_busy<T>(shared: &PoolShared<T>, worker_id: usize, busy: bool) {
    if let Some(worker) = shared.stats.lock().workers.get_mut(&worker_id) {
        worker.busy = busy;
    }
}

fn bump_completed<T>(shared: &PoolShared<T>) {
    shared.stats.lock().total_completed += 1;
}

fn bump_failed<T>(shared: &PoolShared<T>) {
    shared.stats.lock().total_failed += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_pool(
        config: PoolConfig,
    ) -> (WorkerPool<&'static str>, Arc<StdMutex<Vec<&'static str>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let pool = WorkerPool::new(config, move |item: WorkItem<&'static str>| {
            let record = Arc::clone(&record);
            Box::pin(async move {
                record.lock().unwrap().push(item.data);
                Ok(())
            })
        });
        (pool, seen)
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn full_queue_rejects_without_throwing() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                queue_capacity: 1,
                ..PoolConfig::default()
            },
            move |_item: WorkItem<u32>| {
                let gate = Arc::clone(&release);
                Box::pin(async move {
                    gate.notified().await;
                    Ok(())
                })
            },
        );
        assert!(pool.submit(WorkItem::new(1, 0)));
        // Wait for the worker to pick up the first item so the queue is free.
        wait_until(|| pool.status().busy_workers == 1).await;
        assert!(pool.submit(WorkItem::new(2, 0)));
        assert!(!pool.submit(WorkItem::new(3, 0)));
        assert_eq!(pool.status().total_rejected, 1);
        // Keep nudging until both queued tasks drain.
        for _ in 0..200 {
            gate.notify_waiters();
            if pool.status().total_completed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.status().total_completed, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn priority_order_with_fifo_ties() {
        // Pool size 1; a primer task holds the worker while A, B, C queue.
        let primer_gate = Arc::new(Notify::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let gate = Arc::clone(&primer_gate);
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                queue_capacity: 10,
                ..PoolConfig::default()
            },
            move |item: WorkItem<&'static str>| {
                let record = Arc::clone(&record);
                let gate = Arc::clone(&gate);
                Box::pin(async move {
                    if item.data == "primer" {
                        gate.notified().await;
                    }
                    record.lock().unwrap().push(item.data);
                    Ok(())
                })
            },
        );
        assert!(pool.submit(WorkItem::new("primer", 100)));
        wait_until(|| pool.status().busy_workers == 1).await;
        assert!(pool.submit(WorkItem::new("A", 0)));
        assert!(pool.submit(WorkItem::new("B", 10)));
        assert!(pool.submit(WorkItem::new("C", 5)));
        primer_gate.notify_waiters();
        wait_until(|| seen.lock().unwrap().len() == 4).await;
        assert_eq!(*seen.lock().unwrap(), vec!["primer", "B", "C", "A"]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn equal_priority_dispatches_fifo() {
        let (pool, seen) = recording_pool(PoolConfig {
            pool_size: 1,
            queue_capacity: 10,
            ..PoolConfig::default()
        });
        for label in ["one", "two", "three"] {
            assert!(pool.submit(WorkItem::new(label, 7)));
        }
        wait_until(|| seen.lock().unwrap().len() == 3).await;
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn busy_workers_never_exceed_pool_size() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (Arc::clone(&concurrent), Arc::clone(&peak));
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 2,
                queue_capacity: 32,
                ..PoolConfig::default()
            },
            move |_item: WorkItem<u32>| {
                let c = Arc::clone(&c);
                let p = Arc::clone(&p);
                Box::pin(async move {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    c.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        );
        for i in 0..8 {
            assert!(pool.submit(WorkItem::new(i, 0)));
        }
        wait_until(|| pool.status().total_completed == 8).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_marks_failure_with_marker() {
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                queue_capacity: 4,
                task_timeout: Duration::from_millis(30),
                ..PoolConfig::default()
            },
            move |_item: WorkItem<u32>| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
            },
        );
        let mut events = pool.subscribe();
        assert!(pool.submit(WorkItem::new(1, 0)));
        wait_until(|| pool.status().total_failed == 1).await;
        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::WorkFailed { timed_out, .. } = event {
                saw_timeout = timed_out;
            }
        }
        assert!(saw_timeout);
        let status = pool.status();
        assert_eq!(status.workers[0].1.last_error.as_deref(), Some("task timed out"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work_and_discards_queue() {
        let (pool, _seen) = recording_pool(PoolConfig {
            pool_size: 1,
            queue_capacity: 10,
            shutdown_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        });
        pool.shutdown().await;
        assert!(!pool.submit(WorkItem::new("late", 0)));
        assert_eq!(pool.status().total_rejected, 1);
    }

    #[tokio::test]
    async fn resize_up_adds_capacity() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (Arc::clone(&concurrent), Arc::clone(&peak));
        let pool = WorkerPool::new(
            PoolConfig {
                pool_size: 1,
                queue_capacity: 32,
                ..PoolConfig::default()
            },
            move |_item: WorkItem<u32>| {
                let c = Arc::clone(&c);
                let p = Arc::clone(&p);
                Box::pin(async move {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    c.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            },
        );
        pool.resize(3).await;
        for i in 0..9 {
            assert!(pool.submit(WorkItem::new(i, 0)));
        }
        wait_until(|| pool.status().total_completed == 9).await;
        assert!(peak.load(Ordering::SeqCst) >= 2);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        pool.shutdown().await;
    }
}
