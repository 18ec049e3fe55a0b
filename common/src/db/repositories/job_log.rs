// Job log repository. Append-only; rows cascade with their job.

use super::parse_uuid;
use crate::db::Store;
use crate::errors::StoreError;
use crate::models::JobLogEntry;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

pub struct JobLogRepository {
    store: Store,
    write_lock: Mutex<()>,
}

impl JobLogRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    #[instrument(skip(self, message))]
    pub async fn append(&self, job_id: Uuid, level: &str, message: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO job_logs (job_id, timestamp, level, message, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(now)
        .bind(level)
        .bind(message)
        .bind(now)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Newest-first log lines for one job.
    #[instrument(skip(self))]
    pub async fn list_for_job(
        &self,
        job_id: Uuid,
        limit: i64,
    ) -> Result<Vec<JobLogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, job_id, timestamp, level, message, created_at
             FROM job_logs WHERE job_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(job_id.to_string())
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter().map(map_entry).collect()
    }

    #[instrument(skip(self))]
    pub async fn count_for_job(&self, job_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_logs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }
}

fn map_entry(row: SqliteRow) -> Result<JobLogEntry, StoreError> {
    let job_id: String = row.try_get("job_id")?;
    Ok(JobLogEntry {
        id: row.try_get("id")?,
        job_id: parse_uuid(&job_id, "job_logs.job_id")?,
        timestamp: row.try_get("timestamp")?,
        level: row.try_get("level")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}
