// Job instance repository: the status machine, heartbeats, recovery, and
// progress counters live here.

use super::{decode_json_or_default, parse_uuid};
use crate::db::Store;
use crate::errors::StoreError;
use crate::models::{JobInstance, JobProgress, JobStatus};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const COLUMNS: &str = "id, parent_id, definition_id, job_type, name, description, source_type, \
                       entity_type, config, source_config_snapshot, auth_snapshot, \
                       refresh_source, seed_urls, status, progress, created_at, started_at, \
                       completed_at, finished_at, last_heartbeat, error, result_count, \
                       failed_count, depth";

/// Repository for job instances (`jobs` table).
pub struct JobRepository {
    store: Store,
    write_lock: Mutex<()>,
}

impl JobRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    #[instrument(skip(self, instance), fields(job_id = %instance.id, name = %instance.name))]
    pub async fn create(&self, instance: &JobInstance) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let config = serde_json::to_string(&instance.config).unwrap_or_else(|_| "{}".to_string());
        let snapshot = serde_json::to_string(&instance.source_config_snapshot)
            .unwrap_or_else(|_| "{}".to_string());
        let auth_snapshot = instance
            .auth_snapshot
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()));
        let seed_urls =
            serde_json::to_string(&instance.seed_urls).unwrap_or_else(|_| "[]".to_string());
        let progress =
            serde_json::to_string(&instance.progress).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(&format!(
            "INSERT INTO jobs ({COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(instance.id.to_string())
        .bind(instance.parent_id.map(|p| p.to_string()))
        .bind(&instance.definition_id)
        .bind(&instance.job_type)
        .bind(&instance.name)
        .bind(&instance.description)
        .bind(&instance.source_type)
        .bind(&instance.entity_type)
        .bind(config)
        .bind(snapshot)
        .bind(auth_snapshot)
        .bind(instance.refresh_source)
        .bind(seed_urls)
        .bind(instance.status.to_string())
        .bind(progress)
        .bind(instance.created_at)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(instance.finished_at)
        .bind(instance.last_heartbeat)
        .bind(&instance.error)
        .bind(instance.result_count)
        .bind(instance.failed_count)
        .bind(instance.depth)
        .execute(self.store.pool())
        .await?;

        info!(job_id = %instance.id, name = %instance.name, "Job instance created");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> Result<Option<JobInstance>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.store.pool())
            .await?;

        row.map(map_instance).transpose()
    }

    #[instrument(skip(self))]
    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = ? ORDER BY created_at"
        ))
        .bind(status.to_string())
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter().map(map_instance).collect()
    }

    #[instrument(skip(self))]
    pub async fn list_children(&self, parent_id: Uuid) -> Result<Vec<JobInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE parent_id = ? ORDER BY created_at"
        ))
        .bind(parent_id.to_string())
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter().map(map_instance).collect()
    }

    /// Whether a pending or running instance of the definition exists. The
    /// scheduler uses this to keep dispatch serialized per definition.
    #[instrument(skip(self))]
    pub async fn has_active_for_definition(&self, definition_id: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs
             WHERE definition_id = ? AND status IN ('pending', 'running')",
        )
        .bind(definition_id)
        .fetch_one(self.store.pool())
        .await?;
        Ok(count > 0)
    }

    /// Transition `pending → running`: stamps `started_at` and the first
    /// heartbeat, and clears any stale terminal timestamps.
    #[instrument(skip(self))]
    pub async fn mark_started(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?, last_heartbeat = ?,
                             completed_at = NULL, finished_at = NULL, error = NULL
             WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Job not found: {}", id)));
        }
        Ok(())
    }

    /// Set the status in one statement. Terminal statuses stamp
    /// `completed_at`/`finished_at`; leaving `running` for `pending` clears
    /// them (the recovery path).
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let terminal_at = if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };

        let result = sqlx::query(
            "UPDATE jobs SET status = ?, error = ?, completed_at = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(error)
        .bind(terminal_at)
        .bind(terminal_at)
        .bind(id.to_string())
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Job not found: {}", id)));
        }

        info!(job_id = %id, status = %status, "Job status updated");
        Ok(())
    }

    /// Terminal transition with counters and progress written in the same
    /// statement. A mismatch between counters and progress is logged, never
    /// fatal.
    #[instrument(skip(self, progress))]
    pub async fn finalize(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        progress: &JobProgress,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let existing: Option<(i64, i64)> =
            sqlx::query_as("SELECT result_count, failed_count FROM jobs WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(self.store.pool())
                .await?;
        if let Some((result_count, failed_count)) = existing {
            if result_count as u64 != progress.completed_urls
                || failed_count as u64 != progress.failed_urls
            {
                warn!(
                    job_id = %id,
                    result_count,
                    failed_count,
                    progress_completed = progress.completed_urls,
                    progress_failed = progress.failed_urls,
                    "Counters disagree with progress on terminal transition"
                );
            }
        }

        let result_count = progress.completed_urls as i64;
        let failed_count = progress.failed_urls as i64;

        let terminal_at = if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };
        let progress_json =
            serde_json::to_string(progress).unwrap_or_else(|_| "{}".to_string());

        let result = sqlx::query(
            "UPDATE jobs SET status = ?, error = ?, progress = ?, result_count = ?,
                             failed_count = ?, completed_at = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(error)
        .bind(progress_json)
        .bind(result_count)
        .bind(failed_count)
        .bind(terminal_at)
        .bind(terminal_at)
        .bind(id.to_string())
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Job not found: {}", id)));
        }

        info!(job_id = %id, status = %status, "Job finalized");
        Ok(())
    }

    /// Refresh the liveness signal consumed by the stale-run sweep.
    #[instrument(skip(self))]
    pub async fn update_heartbeat(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        sqlx::query("UPDATE jobs SET last_heartbeat = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Shutdown/startup recovery primitive: demote every `running` row to
    /// `pending` with terminal timestamps cleared, so the next scheduler
    /// pass can resume them.
    #[instrument(skip(self))]
    pub async fn mark_running_as_pending(&self, reason: &str) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', completed_at = NULL, finished_at = NULL,
                             error = NULL
             WHERE status = 'running'",
        )
        .execute(self.store.pool())
        .await?;

        let demoted = result.rows_affected();
        if demoted > 0 {
            info!(count = demoted, reason = reason, "Demoted running jobs to pending");
        }
        Ok(demoted)
    }

    /// Running rows whose freshest liveness signal predates the threshold.
    #[instrument(skip(self))]
    pub async fn get_stale(&self, threshold_minutes: i64) -> Result<Vec<JobInstance>, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::minutes(threshold_minutes);
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE status = 'running'
               AND COALESCE(last_heartbeat, started_at, created_at) < ?"
        ))
        .bind(cutoff)
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter().map(map_instance).collect()
    }

    /// Atomic counter-delta path used by crawl workers: read the progress
    /// JSON, apply deltas, recompute the percentage, and rewrite it together
    /// with the running counters, all under the write mutex.
    #[instrument(skip(self))]
    pub async fn apply_progress_delta(
        &self,
        id: Uuid,
        completed_delta: u64,
        failed_delta: u64,
        pending_urls: u64,
        total_urls: u64,
    ) -> Result<JobProgress, StoreError> {
        let _guard = self.write_lock.lock().await;

        let raw: Option<String> = sqlx::query_scalar("SELECT progress FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.store.pool())
            .await?;
        let raw = raw.ok_or_else(|| StoreError::NotFound(format!("Job not found: {}", id)))?;

        let mut progress: JobProgress = decode_json_or_default(&raw, "jobs.progress");
        progress.completed_urls += completed_delta;
        progress.failed_urls += failed_delta;
        progress.pending_urls = pending_urls;
        progress.total_urls = total_urls;
        progress.recompute_percentage();

        let progress_json =
            serde_json::to_string(&progress).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            "UPDATE jobs SET progress = ?, result_count = ?, failed_count = ? WHERE id = ?",
        )
        .bind(progress_json)
        .bind(progress.completed_urls as i64)
        .bind(progress.failed_urls as i64)
        .bind(id.to_string())
        .execute(self.store.pool())
        .await?;

        Ok(progress)
    }

    /// Replace the progress JSON wholesale.
    #[instrument(skip(self, progress))]
    pub async fn set_progress(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let progress_json =
            serde_json::to_string(progress).unwrap_or_else(|_| "{}".to_string());

        sqlx::query("UPDATE jobs SET progress = ? WHERE id = ?")
            .bind(progress_json)
            .bind(id.to_string())
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Delete a job. Children, seen URLs, and logs go with it (CASCADE).
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Job not found: {}", id)));
        }

        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Delete terminal jobs older than the retention window. Used by the
    /// maintenance action; returns the number of rows removed.
    #[instrument(skip(self))]
    pub async fn prune_terminal_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;

        let cutoff = Utc::now() - ChronoDuration::days(days);
        let result = sqlx::query(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < ?",
        )
        .bind(cutoff)
        .execute(self.store.pool())
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.to_string())
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }
}

fn map_instance(row: SqliteRow) -> Result<JobInstance, StoreError> {
    let id: String = row.try_get("id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let status: String = row.try_get("status")?;
    let config: String = row.try_get("config")?;
    let snapshot: String = row.try_get("source_config_snapshot")?;
    let auth_snapshot: Option<String> = row.try_get("auth_snapshot")?;
    let seed_urls: String = row.try_get("seed_urls")?;
    let progress: String = row.try_get("progress")?;

    let parent_id = parent_id
        .map(|p| parse_uuid(&p, "jobs.parent_id"))
        .transpose()?;

    Ok(JobInstance {
        id: parse_uuid(&id, "jobs.id")?,
        parent_id,
        definition_id: row.try_get("definition_id")?,
        job_type: row.try_get("job_type")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        source_type: row.try_get("source_type")?,
        entity_type: row.try_get("entity_type")?,
        config: decode_json_or_default(&config, "jobs.config"),
        source_config_snapshot: decode_json_or_default(&snapshot, "jobs.source_config_snapshot"),
        auth_snapshot: auth_snapshot
            .map(|raw| decode_json_or_default(&raw, "jobs.auth_snapshot")),
        refresh_source: row.try_get("refresh_source")?,
        seed_urls: decode_json_or_default(&seed_urls, "jobs.seed_urls"),
        status: JobStatus::from_str(&status)
            .map_err(StoreError::QueryFailed)?,
        progress: decode_json_or_default(&progress, "jobs.progress"),
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        finished_at: row.try_get("finished_at")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        error: row.try_get("error")?,
        result_count: row.try_get("result_count")?,
        failed_count: row.try_get("failed_count")?,
        depth: row.try_get("depth")?,
    })
}
