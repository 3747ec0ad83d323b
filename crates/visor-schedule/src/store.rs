//! The schedule store: a durable set of [`Schedule`] rows behind a
//! pluggable backend, with optional HA lock operations.
//!
//! Mutations go through a store-level guard so read-modify-write updates
//! are atomic per schedule even on backends without native transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use visor_types::{Schedule, ScheduleStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schedule '{0}' not found")]
    NotFound(String),
    #[error("schedule '{0}' already exists")]
    AlreadyExists(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// An HA lock token; opaque to callers, unique per acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Persistence operations a backend must provide. Lock operations default
/// to single-node no-op grants; SQL backends override them with real
/// TTL-bounded exclusive locks.
#[async_trait]
pub trait ScheduleBackend: Send + Sync {
    async fn insert(&self, schedule: Schedule) -> Result<(), StoreError>;
    async fn fetch(&self, id: &str) -> Result<Option<Schedule>, StoreError>;
    async fn fetch_all(&self) -> Result<Vec<Schedule>, StoreError>;
    async fn replace(&self, schedule: Schedule) -> Result<(), StoreError>;
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;
    /// Force buffered state to durable storage.
    async fn flush(&self) -> Result<(), StoreError>;

    async fn try_acquire_lock(
        &self,
        schedule_id: &str,
        node_id: &str,
        ttl_seconds: u64,
    ) -> Result<Option<LockToken>, StoreError>;

    async fn renew_lock(
        &self,
        schedule_id: &str,
        token: &LockToken,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError>;

    async fn release_lock(&self, schedule_id: &str, token: &LockToken) -> Result<(), StoreError>;
}

/// Public store API used by the scheduler and the CLI.
pub struct ScheduleStore {
    backend: Box<dyn ScheduleBackend>,
    write_guard: tokio::sync::Mutex<()>,
}

impl ScheduleStore {
    pub fn new(backend: Box<dyn ScheduleBackend>) -> Self {
        Self {
            backend,
            write_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn create(&self, schedule: Schedule) -> Result<(), StoreError> {
        let _guard = self.write_guard.lock().await;
        if self.backend.fetch(&schedule.id).await?.is_some() {
            return Err(StoreError::AlreadyExists(schedule.id));
        }
        self.backend.insert(schedule).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        self.backend.fetch(id).await
    }

    pub async fn get_all(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut all = self.backend.fetch_all().await?;
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    pub async fn get_active(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|s| s.status == ScheduleStatus::Active)
            .collect())
    }

    /// Active schedules with `next_run_at <= now`, ordered by
    /// `(next_run_at asc, id asc)` — the scheduler's firing order.
    pub async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let mut due: Vec<Schedule> = self
            .get_active()
            .await?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(due)
    }

    /// Atomic read-modify-write of one schedule.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Schedule, StoreError>
    where
        F: FnOnce(&mut Schedule) + Send,
    {
        let _guard = self.write_guard.lock().await;
        let mut schedule = self
            .backend
            .fetch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(&mut schedule);
        schedule.updated_at = Utc::now();
        self.backend.replace(schedule.clone()).await?;
        Ok(schedule)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_guard.lock().await;
        self.backend.remove(id).await
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush().await
    }

    pub async fn try_acquire_lock(
        &self,
        schedule_id: &str,
        node_id: &str,
        ttl_seconds: u64,
    ) -> Result<Option<LockToken>, StoreError> {
        self.backend
            .try_acquire_lock(schedule_id, node_id, ttl_seconds)
            .await
    }

    pub async fn renew_lock(
        &self,
        schedule_id: &str,
        token: &LockToken,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        self.backend.renew_lock(schedule_id, token, ttl_seconds).await
    }

    pub async fn release_lock(
        &self,
        schedule_id: &str,
        token: &LockToken,
    ) -> Result<(), StoreError> {
        self.backend.release_lock(schedule_id, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::Duration;

    fn store() -> ScheduleStore {
        ScheduleStore::new(Box::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn create_get_update_delete_round_trip() {
        let store = store();
        let schedule = Schedule::one_shot(Utc::now() + Duration::minutes(5));
        let id = schedule.id.clone();
        store.create(schedule.clone()).await.unwrap();
        assert!(store.create(schedule).await.is_err());

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ScheduleStatus::Active);

        let updated = store
            .update(&id, |s| s.status = ScheduleStatus::Paused)
            .await
            .unwrap();
        assert_eq!(updated.status, ScheduleStatus::Paused);

        assert!(store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn due_ordering_is_next_run_then_id() {
        let store = store();
        let now = Utc::now();
        let mut early = Schedule::one_shot(now - Duration::seconds(10));
        early.id = "bbb".to_string();
        let mut earlier = Schedule::one_shot(now - Duration::seconds(20));
        earlier.id = "zzz".to_string();
        let mut tied = Schedule::one_shot(now - Duration::seconds(10));
        tied.id = "aaa".to_string();
        let mut future = Schedule::one_shot(now + Duration::minutes(5));
        future.id = "future".to_string();
        for s in [early, earlier, tied, future] {
            store.create(s).await.unwrap();
        }
        let due: Vec<String> = store
            .get_due(now)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(due, vec!["zzz", "aaa", "bbb"]);
    }

    #[tokio::test]
    async fn paused_schedules_are_not_active() {
        let store = store();
        let mut schedule = Schedule::recurring("*/5 * * * *");
        schedule.next_run_at = Some(Utc::now() - Duration::seconds(1));
        let id = schedule.id.clone();
        store.create(schedule).await.unwrap();
        store
            .update(&id, |s| s.status = ScheduleStatus::Paused)
            .await
            .unwrap();
        assert!(store.get_active().await.unwrap().is_empty());
        assert!(store.get_due(Utc::now()).await.unwrap().is_empty());
    }
}
