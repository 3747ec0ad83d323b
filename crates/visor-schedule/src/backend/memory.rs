//! In-process backend. Locks are real but process-local: good for tests
//! and single-node development, meaningless across machines.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use visor_types::Schedule;

use crate::store::{LockToken, ScheduleBackend, StoreError};

#[derive(Debug, Clone)]
pub(crate) struct LockEntry {
    pub token: String,
    pub holder_node_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    schedules: Arc<Mutex<HashMap<String, Schedule>>>,
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleBackend for MemoryBackend {
    async fn insert(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.schedules.lock().insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        Ok(self.schedules.lock().get(id).cloned())
    }

    async fn fetch_all(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.schedules.lock().values().cloned().collect())
    }

    async fn replace(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.schedules.lock().insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.schedules.lock().remove(id).is_some())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        schedule_id: &str,
        node_id: &str,
        ttl_seconds: u64,
    ) -> Result<Option<LockToken>, StoreError> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(schedule_id) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let token = LockToken::fresh();
        locks.insert(
            schedule_id.to_string(),
            LockEntry {
                token: token.0.clone(),
                holder_node_id: node_id.to_string(),
                expires_at: now + Duration::seconds(ttl_seconds as i64),
            },
        );
        Ok(Some(token))
    }

    async fn renew_lock(
        &self,
        schedule_id: &str,
        token: &LockToken,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        match locks.get_mut(schedule_id) {
            Some(entry) if entry.token == token.0 && entry.expires_at > now => {
                entry.expires_at = now + Duration::seconds(ttl_seconds as i64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, schedule_id: &str, token: &LockToken) -> Result<(), StoreError> {
        let mut locks = self.locks.lock();
        if locks
            .get(schedule_id)
            .map(|entry| entry.token == token.0)
            .unwrap_or(false)
        {
            locks.remove(schedule_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let backend = MemoryBackend::new();
        let token = backend
            .try_acquire_lock("sched", "node-a", 60)
            .await
            .unwrap()
            .expect("first acquisition succeeds");
        assert!(backend
            .try_acquire_lock("sched", "node-b", 60)
            .await
            .unwrap()
            .is_none());
        backend.release_lock("sched", &token).await.unwrap();
        assert!(backend
            .try_acquire_lock("sched", "node-b", 60)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_stolen() {
        let backend = MemoryBackend::new();
        let stale = backend
            .try_acquire_lock("sched", "node-a", 0)
            .await
            .unwrap()
            .expect("acquired with zero ttl");
        // Zero TTL means the lock expired the instant it was taken.
        let fresh = backend
            .try_acquire_lock("sched", "node-b", 60)
            .await
            .unwrap();
        assert!(fresh.is_some());
        // The stale token can no longer renew.
        assert!(!backend.renew_lock("sched", &stale, 60).await.unwrap());
    }

    #[tokio::test]
    async fn renew_extends_a_held_lock() {
        let backend = MemoryBackend::new();
        let token = backend
            .try_acquire_lock("sched", "node-a", 60)
            .await
            .unwrap()
            .unwrap();
        assert!(backend.renew_lock("sched", &token, 120).await.unwrap());
        // A foreign token never renews.
        assert!(!backend
            .renew_lock("sched", &LockToken::fresh(), 120)
            .await
            .unwrap());
    }
}
