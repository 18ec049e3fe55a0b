// Scheduler engine.
//
// The loop is paced by a monotonic interval; cron matching uses wall-clock
// UTC. Dispatch is serialized per definition: a definition with an active
// run (in memory or in the store) is skipped until that run reaches a
// terminal state. Pre-jobs run as child instances before their parent;
// post-jobs are enqueued as children after a successful parent.

use crate::db::repositories::auth::AuthRepository;
use crate::db::repositories::job::JobRepository;
use crate::db::repositories::job_definition::JobDefinitionRepository;
use crate::errors::ExecutionError;
use crate::executor::JobRunner;
use crate::models::{JobDefinition, JobInstance, JobStatus};
use crate::schedule::next_fire_time;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
}

impl From<&crate::config::SchedulerConfig> for SchedulerConfig {
    fn from(config: &crate::config::SchedulerConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_seconds.max(1)),
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    definitions: Arc<JobDefinitionRepository>,
    auth: Arc<AuthRepository>,
    jobs: Arc<JobRepository>,
    runner: Arc<JobRunner>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    /// Definitions with a dispatch currently in flight.
    active: Arc<Mutex<HashSet<String>>>,
    /// Next cron fire per definition id.
    next_fires: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        definitions: Arc<JobDefinitionRepository>,
        auth: Arc<AuthRepository>,
        jobs: Arc<JobRepository>,
        runner: Arc<JobRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            definitions,
            auth,
            jobs,
            runner,
            shutdown,
            tracker: TaskTracker::new(),
            active: Arc::new(Mutex::new(HashSet::new())),
            next_fires: Mutex::new(HashMap::new()),
        }
    }

    /// Run the scheduler until shutdown. On the way out, waits for in-flight
    /// runs to observe cancellation and demotes whatever was still running.
    #[instrument(skip(self))]
    pub async fn start(self: Arc<Self>) -> Result<(), ExecutionError> {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Scheduler starting"
        );

        self.resume_pending().await;
        self.dispatch_auto_start().await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        // Executors observe the cancelled token and finish their terminal
        // writes before we demote what remains.
        self.tracker.close();
        self.tracker.wait().await;
        self.jobs.mark_running_as_pending("shutdown").await?;

        info!("Scheduler stopped");
        Ok(())
    }

    /// One pass over the enabled definitions: fire whatever is due.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, ExecutionError> {
        let definitions = self.definitions.list_enabled().await?;
        let mut dispatched = 0;

        for definition in definitions {
            if definition.schedule.trim().is_empty() {
                continue;
            }

            let due = {
                let mut fires = self.next_fires.lock().await;
                match fires.get(&definition.id) {
                    Some(next) if *next <= now => true,
                    Some(_) => false,
                    None => {
                        // First sighting: register the upcoming fire, don't
                        // fire retroactively.
                        match next_fire_time(&definition.schedule, now) {
                            Ok(next) => {
                                fires.insert(definition.id.clone(), next);
                            }
                            Err(e) => {
                                warn!(definition_id = %definition.id, error = %e, "Unschedulable cron expression");
                            }
                        }
                        false
                    }
                }
            };

            if !due {
                continue;
            }

            match next_fire_time(&definition.schedule, now) {
                Ok(next) => {
                    self.next_fires.lock().await.insert(definition.id.clone(), next);
                }
                Err(e) => {
                    warn!(definition_id = %definition.id, error = %e, "Unschedulable cron expression");
                    self.next_fires.lock().await.remove(&definition.id);
                }
            }

            match self.dispatch(&definition).await {
                Ok(Some(_)) => dispatched += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(definition_id = %definition.id, error = %e, "Dispatch failed");
                }
            }
        }

        Ok(dispatched)
    }

    /// Create and launch a run for a definition id, outside the cron path.
    pub async fn dispatch_definition(&self, definition_id: &str) -> Result<Uuid, ExecutionError> {
        let definition = self
            .definitions
            .get(definition_id)
            .await?
            .ok_or_else(|| ExecutionError::DefinitionNotFound(definition_id.to_string()))?;

        self.dispatch(&definition)
            .await?
            .ok_or_else(|| ExecutionError::ActionFailed(format!(
                "definition '{}' already has an active run",
                definition_id
            )))
    }

    /// Create a pending instance (with pre/post composition) and hand it to
    /// the executor on a tracked task. Returns None when the definition
    /// already has an active run.
    async fn dispatch(&self, definition: &JobDefinition) -> Result<Option<Uuid>, ExecutionError> {
        {
            let mut active = self.active.lock().await;
            if active.contains(&definition.id) {
                debug!(definition_id = %definition.id, "Dispatch already in flight; skipping");
                return Ok(None);
            }
            if self.jobs.has_active_for_definition(&definition.id).await? {
                debug!(definition_id = %definition.id, "Active run in store; skipping");
                return Ok(None);
            }
            active.insert(definition.id.clone());
        }

        let auth = match definition.auth_id {
            Some(auth_id) => self.auth.get_by_id(auth_id).await?,
            None => None,
        };

        let instance = JobInstance::from_definition(definition, auth.as_ref());
        let instance_id = instance.id;
        if let Err(e) = self.jobs.create(&instance).await {
            self.active.lock().await.remove(&definition.id);
            return Err(e.into());
        }

        info!(definition_id = %definition.id, job_id = %instance_id, "Run dispatched");
        self.spawn_run(definition.clone(), instance_id);
        Ok(Some(instance_id))
    }

    fn spawn_run(&self, definition: JobDefinition, instance_id: Uuid) {
        let definitions = Arc::clone(&self.definitions);
        let auth = Arc::clone(&self.auth);
        let jobs = Arc::clone(&self.jobs);
        let runner = Arc::clone(&self.runner);
        let active = Arc::clone(&self.active);
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            let run = RunOrchestration {
                definitions,
                auth,
                jobs,
                runner,
                shutdown,
            };
            run.execute(&definition, instance_id).await;
            active.lock().await.remove(&definition.id);
        });
    }

    /// Pick pending rows back up after a restart (or a recovered shutdown).
    async fn resume_pending(&self) {
        let pending = match self.jobs.list_by_status(JobStatus::Pending).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Could not list pending runs");
                return;
            }
        };

        for instance in pending {
            let Some(definition_id) = instance.definition_id.clone() else {
                continue;
            };
            let definition = match self.definitions.get(&definition_id).await {
                Ok(Some(definition)) => definition,
                Ok(None) => {
                    warn!(job_id = %instance.id, definition_id = %definition_id, "Pending run references a missing definition");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Definition lookup failed");
                    continue;
                }
            };

            let mut active = self.active.lock().await;
            if active.contains(&definition_id) {
                continue;
            }
            active.insert(definition_id.clone());
            drop(active);

            info!(job_id = %instance.id, definition_id = %definition_id, "Resuming pending run");
            self.spawn_run(definition, instance.id);
        }
    }

    async fn dispatch_auto_start(&self) {
        let definitions = match self.definitions.list_enabled().await {
            Ok(definitions) => definitions,
            Err(e) => {
                error!(error = %e, "Could not list definitions for auto-start");
                return;
            }
        };

        for definition in definitions.iter().filter(|d| d.auto_start) {
            match self.dispatch(definition).await {
                Ok(Some(id)) => info!(definition_id = %definition.id, job_id = %id, "Auto-start run created"),
                Ok(None) => {}
                Err(e) => error!(definition_id = %definition.id, error = %e, "Auto-start dispatch failed"),
            }
        }
    }
}

/// One dispatched run: pre-jobs, then the parent, then post-jobs.
struct RunOrchestration {
    definitions: Arc<JobDefinitionRepository>,
    auth: Arc<AuthRepository>,
    jobs: Arc<JobRepository>,
    runner: Arc<JobRunner>,
    shutdown: CancellationToken,
}

impl RunOrchestration {
    async fn execute(&self, definition: &JobDefinition, instance_id: Uuid) {
        // Pre-jobs gate the parent: every one must complete.
        for pre_id in &definition.pre_jobs {
            match self.run_child(pre_id, instance_id, 1).await {
                Ok(JobStatus::Completed) => {}
                Ok(_) if self.shutdown.is_cancelled() => {
                    // Parent stays pending; the next startup resumes it.
                    return;
                }
                Ok(status) => {
                    let reason = format!("pre-job '{}' ended {}", pre_id, status);
                    warn!(job_id = %instance_id, reason = %reason, "Parent not eligible");
                    if let Err(e) = self
                        .jobs
                        .update_status(instance_id, JobStatus::Failed, Some(&reason))
                        .await
                    {
                        error!(job_id = %instance_id, error = %e, "Could not fail parent");
                    }
                    return;
                }
                Err(e) => {
                    let reason = format!("pre-job '{}' failed: {}", pre_id, e);
                    if let Err(store_err) = self
                        .jobs
                        .update_status(instance_id, JobStatus::Failed, Some(&reason))
                        .await
                    {
                        error!(job_id = %instance_id, error = %store_err, "Could not fail parent");
                    }
                    return;
                }
            }
        }

        let status = match self
            .runner
            .run(instance_id, self.shutdown.child_token())
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!(job_id = %instance_id, error = %e, "Run failed to execute");
                return;
            }
        };

        if status != JobStatus::Completed {
            return;
        }

        // Post-jobs run under the engine token, not the (finished) parent's.
        for post_id in &definition.post_jobs {
            if self.shutdown.is_cancelled() {
                return;
            }
            if let Err(e) = self.run_child(post_id, instance_id, 1).await {
                error!(job_id = %instance_id, post_job = %post_id, error = %e, "Post-job failed");
            }
        }
    }

    /// Instantiate and run one child definition linked to `parent_id`.
    async fn run_child(
        &self,
        definition_id: &str,
        parent_id: Uuid,
        depth: i64,
    ) -> Result<JobStatus, ExecutionError> {
        let definition = self
            .definitions
            .get(definition_id)
            .await?
            .ok_or_else(|| ExecutionError::DefinitionNotFound(definition_id.to_string()))?;

        let auth = match definition.auth_id {
            Some(auth_id) => self.auth.get_by_id(auth_id).await?,
            None => None,
        };

        let mut child = JobInstance::from_definition(&definition, auth.as_ref());
        child.parent_id = Some(parent_id);
        child.depth = depth;
        let child_id = child.id;
        self.jobs.create(&child).await?;

        info!(parent_id = %parent_id, job_id = %child_id, definition_id = %definition_id, "Child run created");
        self.runner.run(child_id, self.shutdown.child_token()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrawlerConfig, ExecutorConfig};
    use crate::db::repositories::document::DocumentRepository;
    use crate::db::repositories::job_log::JobLogRepository;
    use crate::db::repositories::seen_url::SeenUrlRepository;
    use crate::db::Store;
    use crate::executor::ActionRegistry;
    use crate::models::{JobDefinitionType, JobOwner, JobStep, StepErrorPolicy};
    use chrono::TimeZone;
    use serde_json::Map;

    #[test]
    fn test_config_conversion_clamps_zero() {
        let config = SchedulerConfig::from(&crate::config::SchedulerConfig {
            poll_interval_seconds: 0,
        });
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    async fn scheduler_fixture() -> (Arc<Scheduler>, Arc<JobDefinitionRepository>, Arc<JobRepository>) {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();

        let definitions = Arc::new(JobDefinitionRepository::new(store.clone()));
        let auth = Arc::new(AuthRepository::new(store.clone()));
        let jobs = Arc::new(JobRepository::new(store.clone()));
        let shutdown = CancellationToken::new();

        let runner = Arc::new(JobRunner::new(
            store.clone(),
            Arc::clone(&jobs),
            Arc::clone(&definitions),
            Arc::new(DocumentRepository::new(store.clone())),
            Arc::new(SeenUrlRepository::new(store.clone())),
            Arc::new(JobLogRepository::new(store.clone())),
            Arc::new(ActionRegistry::with_builtins()),
            ExecutorConfig {
                heartbeat_interval_seconds: 1,
                default_timeout_seconds: 30,
            },
            CrawlerConfig {
                user_agent: "test".to_string(),
                fetch_timeout_seconds: 5,
                default_concurrency: 1,
                default_max_pages: 10,
            },
            shutdown.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig {
                poll_interval: Duration::from_secs(1),
            },
            Arc::clone(&definitions),
            auth,
            Arc::clone(&jobs),
            runner,
            shutdown,
        ));

        (scheduler, definitions, jobs)
    }

    fn summary_definition(id: &str, schedule: &str) -> JobDefinition {
        JobDefinition {
            id: id.to_string(),
            name: id.to_string(),
            def_type: JobDefinitionType::Summarizer,
            job_type: JobOwner::User,
            description: String::new(),
            source_type: String::new(),
            base_url: String::new(),
            auth_id: None,
            steps: vec![JobStep {
                name: "summarize".to_string(),
                action: "corpus_summary".to_string(),
                config: Map::new(),
                on_error: StepErrorPolicy::Fail,
            }],
            schedule: schedule.to_string(),
            timeout: String::new(),
            enabled: true,
            auto_start: false,
            config: Map::new(),
            pre_jobs: vec![],
            post_jobs: vec![],
            error_tolerance: None,
            raw_source: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_unknown_definition() {
        let (scheduler, _definitions, _jobs) = scheduler_fixture().await;
        let err = scheduler.dispatch_definition("nope").await.unwrap_err();
        assert!(matches!(err, ExecutionError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn test_first_sighting_registers_without_firing() {
        let (scheduler, definitions, jobs) = scheduler_fixture().await;
        definitions
            .save(&summary_definition("hourly", "0 * * * *"))
            .await
            .unwrap();

        // Two ticks inside the same hour: registration only, no dispatch.
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 0).unwrap();
        assert_eq!(scheduler.tick(t0).await.unwrap(), 0);
        assert_eq!(
            scheduler.tick(t0 + chrono::Duration::seconds(10)).await.unwrap(),
            0
        );
        assert_eq!(jobs.list_by_status(JobStatus::Pending).await.unwrap().len(), 0);

        // Crossing the registered fire time dispatches exactly once.
        let t1 = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 1).unwrap();
        assert_eq!(scheduler.tick(t1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_serialized_per_definition() {
        let (scheduler, definitions, jobs) = scheduler_fixture().await;
        definitions
            .save(&summary_definition("manual", ""))
            .await
            .unwrap();

        let first = scheduler.dispatch_definition("manual").await.unwrap();

        // The first run may still be in flight or already terminal; force
        // the serialized case by parking a pending row for the definition.
        let mut rival = JobInstance::from_definition(
            &definitions.get("manual").await.unwrap().unwrap(),
            None,
        );
        rival.definition_id = Some("manual".to_string());
        jobs.create(&rival).await.unwrap();

        let second = scheduler.dispatch_definition("manual").await;
        assert!(second.is_err(), "second dispatch must be refused");
        assert_ne!(first, rival.id);
    }
}
