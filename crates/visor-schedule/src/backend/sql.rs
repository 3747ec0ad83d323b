//! Postgres backend. Schedule rows are stored as JSONB documents with the
//! scheduling columns lifted out for querying; HA locks live in a separate
//! `visor_locks` table with transactional acquisition and TTL expiry.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use visor_types::Schedule;

use crate::store::{LockToken, ScheduleBackend, StoreError};

pub struct SqlBackend {
    pool: PgPool,
}

impl SqlBackend {
    /// Connect and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(sql_err)?;
        let backend = Self { pool };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS visor_schedules (
                id          TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                next_run_at TIMESTAMPTZ,
                data        JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS visor_locks (
                schedule_id    TEXT PRIMARY KEY,
                token          TEXT NOT NULL,
                holder_node_id TEXT NOT NULL,
                expires_at     TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    fn row_to_schedule(row: &sqlx::postgres::PgRow) -> Result<Schedule, StoreError> {
        let data: serde_json::Value = row.try_get("data").map_err(sql_err)?;
        Ok(serde_json::from_value(data)?)
    }

    async fn upsert(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let data = serde_json::to_value(schedule)?;
        let status = serde_json::to_value(schedule.status)?
            .as_str()
            .unwrap_or("active")
            .to_string();
        sqlx::query(
            r#"
            INSERT INTO visor_schedules (id, status, next_run_at, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                next_run_at = EXCLUDED.next_run_at,
                data = EXCLUDED.data
            "#,
        )
        .bind(&schedule.id)
        .bind(status)
        .bind(schedule.next_run_at)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl ScheduleBackend for SqlBackend {
    async fn insert(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.upsert(&schedule).await
    }

    async fn fetch(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query("SELECT data FROM visor_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;
        row.as_ref().map(Self::row_to_schedule).transpose()
    }

    async fn fetch_all(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query("SELECT data FROM visor_schedules ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        rows.iter().map(Self::row_to_schedule).collect()
    }

    async fn replace(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.upsert(&schedule).await
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM visor_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        // Writes are immediate; nothing is buffered.
        Ok(())
    }

    /// Acquisition runs in one transaction: expired rows are reaped, then
    /// an insert either wins the primary key or loses to the live holder.
    async fn try_acquire_lock(
        &self,
        schedule_id: &str,
        node_id: &str,
        ttl_seconds: u64,
    ) -> Result<Option<LockToken>, StoreError> {
        let now = Utc::now();
        let token = LockToken::fresh();
        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        sqlx::query("DELETE FROM visor_locks WHERE schedule_id = $1 AND expires_at <= $2")
            .bind(schedule_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO visor_locks (schedule_id, token, holder_node_id, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (schedule_id) DO NOTHING
            "#,
        )
        .bind(schedule_id)
        .bind(&token.0)
        .bind(node_id)
        .bind(now + Duration::seconds(ttl_seconds as i64))
        .execute(&mut *tx)
        .await
        .map_err(sql_err)?;

        tx.commit().await.map_err(sql_err)?;
        Ok((inserted.rows_affected() > 0).then_some(token))
    }

    async fn renew_lock(
        &self,
        schedule_id: &str,
        token: &LockToken,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE visor_locks
            SET expires_at = $1
            WHERE schedule_id = $2 AND token = $3 AND expires_at > $4
            "#,
        )
        .bind(now + Duration::seconds(ttl_seconds as i64))
        .bind(schedule_id)
        .bind(&token.0)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, schedule_id: &str, token: &LockToken) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM visor_locks WHERE schedule_id = $1 AND token = $2")
            .bind(schedule_id)
            .bind(&token.0)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}
