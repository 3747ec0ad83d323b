//! JSON-file backend, default path `.visor/schedules.json`. Rows hold the
//! full schedule entity; every mutation rewrites the file. Locks are
//! process-local like the memory backend — single-node development only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::warn;

use visor_types::Schedule;

use crate::store::{LockToken, ScheduleBackend, StoreError};

pub const DEFAULT_SCHEDULES_PATH: &str = ".visor/schedules.json";

struct FileLock {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct FileBackend {
    path: PathBuf,
    schedules: Arc<Mutex<HashMap<String, Schedule>>>,
    locks: Mutex<HashMap<String, FileLock>>,
}

impl FileBackend {
    /// Open (or create) the backing file and load existing rows. A corrupt
    /// file is treated as empty with a warning rather than a hard failure.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let schedules = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<Schedule>>(&bytes) {
                Ok(rows) => rows.into_iter().map(|s| (s.id.clone(), s)).collect(),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "schedules file is corrupt; starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            schedules: Arc::new(Mutex::new(schedules)),
            locks: Mutex::new(HashMap::new()),
        })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let mut rows: Vec<Schedule> = self.schedules.lock().values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let json = serde_json::to_vec_pretty(&rows)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleBackend for FileBackend {
    async fn insert(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.schedules.lock().insert(schedule.id.clone(), schedule);
        self.persist().await
    }

    async fn fetch(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        Ok(self.schedules.lock().get(id).cloned())
    }

    async fn fetch_all(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.schedules.lock().values().cloned().collect())
    }

    async fn replace(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.schedules.lock().insert(schedule.id.clone(), schedule);
        self.persist().await
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.schedules.lock().remove(id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.persist().await
    }

    async fn try_acquire_lock(
        &self,
        schedule_id: &str,
        _node_id: &str,
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
            FileLock {
                token: token.0.clone(),
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
    async fn rows_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");

        let backend = FileBackend::open(&path).await.unwrap();
        let schedule = Schedule::recurring("*/5 * * * *");
        let id = schedule.id.clone();
        backend.insert(schedule).await.unwrap();
        drop(backend);

        let reopened = FileBackend::open(&path).await.unwrap();
        let loaded = reopened.fetch(&id).await.unwrap().unwrap();
        assert_eq!(loaded.cron.as_deref(), Some("*/5 * * * *"));
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let backend = FileBackend::open(&path).await.unwrap();
        assert!(backend.fetch_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_rewrites_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        let backend = FileBackend::open(&path).await.unwrap();
        let schedule = Schedule::recurring("0 * * * *");
        let id = schedule.id.clone();
        backend.insert(schedule).await.unwrap();
        assert!(backend.remove(&id).await.unwrap());

        let reopened = FileBackend::open(&path).await.unwrap();
        assert!(reopened.fetch_all().await.unwrap().is_empty());
    }
}
