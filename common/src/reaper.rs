// Stale-run reaper.
//
// A running instance whose freshest liveness signal (heartbeat, then
// started_at, then created_at) is older than the threshold lost its
// executor (crash, kill, or wedged action). The sweep demotes such rows
// to `failed` with reason "heartbeat lost"; they are not retried here, the
// scheduler's next tick may create a fresh run.

use crate::config::ReaperConfig;
use crate::db::repositories::job::JobRepository;
use crate::db::repositories::job_log::JobLogRepository;
use crate::models::JobStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const HEARTBEAT_LOST: &str = "heartbeat lost";

pub struct StaleJobReaper {
    jobs: Arc<JobRepository>,
    logs: Arc<JobLogRepository>,
    config: ReaperConfig,
}

impl StaleJobReaper {
    pub fn new(jobs: Arc<JobRepository>, logs: Arc<JobLogRepository>, config: ReaperConfig) -> Self {
        Self { jobs, logs, config }
    }

    /// Periodic sweep until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_seconds = self.config.interval_seconds,
            threshold_minutes = self.config.stale_threshold_minutes,
            "Stale-run reaper started"
        );

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Reaper sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Stale-run reaper stopped");
                    return;
                }
            }
        }
    }

    /// One sweep; returns how many rows were demoted.
    pub async fn sweep(&self) -> Result<usize, crate::errors::StoreError> {
        let stale = self.jobs.get_stale(self.config.stale_threshold_minutes).await?;
        if stale.is_empty() {
            debug!("No stale runs");
            return Ok(0);
        }

        let mut reaped = 0;
        for instance in stale {
            warn!(
                job_id = %instance.id,
                name = %instance.name,
                last_heartbeat = ?instance.last_heartbeat,
                "Run lost its heartbeat; marking failed"
            );
            match self
                .jobs
                .update_status(instance.id, JobStatus::Failed, Some(HEARTBEAT_LOST))
                .await
            {
                Ok(()) => {
                    reaped += 1;
                    if let Err(e) = self.logs.append(instance.id, "error", HEARTBEAT_LOST).await {
                        debug!(error = %e, "Could not append reaper log");
                    }
                }
                Err(e) => warn!(job_id = %instance.id, error = %e, "Failed to reap run"),
            }
        }

        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::models::{JobInstance, JobProgress};
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::{Map, Value};
    use uuid::Uuid;

    fn instance(name: &str) -> JobInstance {
        JobInstance {
            id: Uuid::new_v4(),
            parent_id: None,
            definition_id: None,
            job_type: "crawler".to_string(),
            name: name.to_string(),
            description: String::new(),
            source_type: String::new(),
            entity_type: String::new(),
            config: Map::new(),
            source_config_snapshot: Value::Object(Map::new()),
            auth_snapshot: None,
            refresh_source: false,
            seed_urls: vec![],
            status: crate::models::JobStatus::Pending,
            progress: JobProgress::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            finished_at: None,
            last_heartbeat: None,
            error: None,
            result_count: 0,
            failed_count: 0,
            depth: 0,
        }
    }

    #[tokio::test]
    async fn test_sweep_reaps_only_stale_runs() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let jobs = Arc::new(JobRepository::new(store.clone()));
        let logs = Arc::new(JobLogRepository::new(store.clone()));

        let fresh = instance("fresh");
        let stale = instance("stale");
        jobs.create(&fresh).await.unwrap();
        jobs.create(&stale).await.unwrap();
        jobs.mark_started(fresh.id).await.unwrap();
        jobs.mark_started(stale.id).await.unwrap();

        let old = Utc::now() - ChronoDuration::minutes(11);
        sqlx::query("UPDATE jobs SET last_heartbeat = ? WHERE id = ?")
            .bind(old)
            .bind(stale.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let reaper = StaleJobReaper::new(
            Arc::clone(&jobs),
            logs,
            ReaperConfig {
                interval_seconds: 60,
                stale_threshold_minutes: 10,
            },
        );

        assert_eq!(reaper.sweep().await.unwrap(), 1);

        let reaped = jobs.get(stale.id).await.unwrap().unwrap();
        assert_eq!(reaped.status, JobStatus::Failed);
        assert_eq!(reaped.error.as_deref(), Some(HEARTBEAT_LOST));
        assert!(reaped.completed_at.is_some());

        let untouched = jobs.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Running);
    }
}
