// Job executor: runs one persisted instance to a terminal state.
//
// Ownership contract: this module is the only writer of an instance's
// status, heartbeats, progress, counters, and terminal timestamps once the
// scheduler has created the row.

pub mod actions;
pub mod registry;

pub use registry::{ActionContext, ActionHandler, ActionOutcome, ActionRegistry};

use crate::config::{CrawlerConfig, ExecutorConfig};
use crate::db::repositories::document::DocumentRepository;
use crate::db::repositories::job::JobRepository;
use crate::db::repositories::job_definition::JobDefinitionRepository;
use crate::db::repositories::job_log::JobLogRepository;
use crate::db::repositories::seen_url::SeenUrlRepository;
use crate::db::Store;
use crate::errors::ExecutionError;
use crate::models::{JobDefinition, JobInstance, JobStatus, JobStep, StepErrorPolicy};
use crate::retry::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub struct JobRunner {
    store: Store,
    jobs: Arc<JobRepository>,
    definitions: Arc<JobDefinitionRepository>,
    documents: Arc<DocumentRepository>,
    seen: Arc<SeenUrlRepository>,
    logs: Arc<JobLogRepository>,
    registry: Arc<ActionRegistry>,
    executor_config: ExecutorConfig,
    crawler_config: CrawlerConfig,
    /// Engine-wide shutdown. A run interrupted by shutdown is left
    /// `running` (no terminal write) so the recovery demotion can return it
    /// to `pending`; an explicitly cancelled run is finalized `cancelled`.
    shutdown: CancellationToken,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        jobs: Arc<JobRepository>,
        definitions: Arc<JobDefinitionRepository>,
        documents: Arc<DocumentRepository>,
        seen: Arc<SeenUrlRepository>,
        logs: Arc<JobLogRepository>,
        registry: Arc<ActionRegistry>,
        executor_config: ExecutorConfig,
        crawler_config: CrawlerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            jobs,
            definitions,
            documents,
            seen,
            logs,
            registry,
            executor_config,
            crawler_config,
            shutdown,
        }
    }

    /// Run one instance to completion. Returns the terminal status that was
    /// persisted.
    #[instrument(skip(self, cancel), fields(job_id = %instance_id))]
    pub async fn run(
        &self,
        instance_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<JobStatus, ExecutionError> {
        let instance = self
            .jobs
            .get(instance_id)
            .await?
            .ok_or_else(|| ExecutionError::JobNotFound(instance_id.to_string()))?;

        let definition = match &instance.definition_id {
            Some(definition_id) => self.definitions.get(definition_id).await?,
            None => None,
        };
        let Some(definition) = definition else {
            let reason = format!(
                "definition '{}' not found",
                instance.definition_id.as_deref().unwrap_or("<none>")
            );
            self.jobs
                .update_status(instance_id, JobStatus::Failed, Some(&reason))
                .await?;
            return Ok(JobStatus::Failed);
        };

        let total_timeout = definition
            .timeout_duration()
            .ok()
            .flatten()
            .unwrap_or(Duration::from_secs(
                self.executor_config.default_timeout_seconds,
            ));

        self.jobs.mark_started(instance_id).await?;
        self.logs
            .append(instance_id, "info", "run started")
            .await?;
        info!(job_id = %instance_id, name = %instance.name, "Run started");

        let heartbeat_stop = self.spawn_heartbeat(instance_id);

        let outcome = tokio::time::timeout(
            total_timeout,
            self.run_steps(&instance, &definition, &cancel),
        )
        .await;

        heartbeat_stop.cancel();

        // Shutdown interruption is not a terminal outcome: leave the row
        // running so mark_running_as_pending can demote it for resumption.
        if self.shutdown.is_cancelled()
            && matches!(&outcome, Ok(Err(ExecutionError::Cancelled)))
        {
            info!(job_id = %instance_id, "Run interrupted by shutdown; leaving for recovery");
            return Ok(JobStatus::Running);
        }

        let (status, error_message) = match outcome {
            Err(_) => (JobStatus::Failed, Some(ExecutionError::Timeout.to_string())),
            Ok(Ok(())) => (JobStatus::Completed, None),
            Ok(Err(ExecutionError::Cancelled)) => {
                (JobStatus::Cancelled, Some(ExecutionError::Cancelled.to_string()))
            }
            Ok(Err(e)) => (JobStatus::Failed, Some(e.to_string())),
        };

        // The crawl pool has been mutating progress while we ran; reread it
        // so the terminal write carries the accumulated counters.
        let progress = self
            .jobs
            .get(instance_id)
            .await?
            .map(|row| row.progress)
            .unwrap_or_default();

        self.jobs
            .finalize(instance_id, status, error_message.as_deref(), &progress)
            .await?;

        let level = if status == JobStatus::Completed { "info" } else { "error" };
        self.logs
            .append(
                instance_id,
                level,
                &format!(
                    "run {} ({} ok, {} failed)",
                    status, progress.completed_urls, progress.failed_urls
                ),
            )
            .await?;
        info!(job_id = %instance_id, status = %status, "Run finished");

        Ok(status)
    }

    /// Background heartbeat for the life of the run; the returned token
    /// stops it.
    fn spawn_heartbeat(&self, instance_id: Uuid) -> CancellationToken {
        let stop = CancellationToken::new();
        let ticker_stop = stop.clone();
        let jobs = Arc::clone(&self.jobs);
        let interval_secs = self.executor_config.heartbeat_interval_seconds;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = jobs.update_heartbeat(instance_id).await {
                            warn!(job_id = %instance_id, error = %e, "Heartbeat write failed");
                        }
                    }
                    _ = ticker_stop.cancelled() => break,
                }
            }
        });

        stop
    }

    async fn run_steps(
        &self,
        instance: &JobInstance,
        definition: &JobDefinition,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let context = ActionContext {
            job: instance.clone(),
            store: self.store.clone(),
            jobs: Arc::clone(&self.jobs),
            documents: Arc::clone(&self.documents),
            seen: Arc::clone(&self.seen),
            logs: Arc::clone(&self.logs),
            crawler: self.crawler_config.clone(),
        };

        for (index, step) in definition.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            info!(
                job_id = %instance.id,
                step_index = index,
                step = %step.name,
                action = %step.action,
                "Executing step"
            );

            if let Some(outcome) = self.execute_step(&context, step, cancel).await? {
                if !outcome.counters_recorded && (outcome.completed > 0 || outcome.failed > 0) {
                    self.bump_progress(instance.id, outcome).await;
                }
            }

            // Liveness between steps; long steps beat through the ticker.
            if let Err(e) = self.jobs.update_heartbeat(instance.id).await {
                warn!(job_id = %instance.id, error = %e, "Heartbeat write failed");
            }

            self.check_tolerance(instance.id, definition).await?;
        }

        Ok(())
    }

    /// One step under its `on_error` policy.
    async fn execute_step(
        &self,
        context: &ActionContext,
        step: &JobStep,
        cancel: &CancellationToken,
    ) -> Result<Option<ActionOutcome>, ExecutionError> {
        let handler = self.registry.get(&step.action);

        let (max_attempts, backoff) = match step.on_error {
            StepErrorPolicy::Retry {
                attempts,
                backoff_seconds,
            } => (
                attempts.saturating_add(1).max(1),
                Some(ExponentialBackoff::new(backoff_seconds.max(1))),
            ),
            _ => (1, None),
        };

        let mut last_error = None;
        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let result = match &handler {
                Some(handler) => handler.execute(context, &step.config, cancel).await,
                None => Err(ExecutionError::UnknownAction(step.action.clone())),
            };

            match result {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(ExecutionError::Cancelled) => return Err(ExecutionError::Cancelled),
                Err(e) => {
                    warn!(
                        job_id = %context.job.id,
                        step = %step.name,
                        attempt = attempt + 1,
                        error = %e,
                        "Step attempt failed"
                    );
                    last_error = Some(e);

                    if attempt + 1 < max_attempts {
                        let delay = backoff
                            .as_ref()
                            .map(|b| b.delay_for(attempt))
                            .unwrap_or_default();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                        }
                    }
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        match step.on_error {
            StepErrorPolicy::Continue => {
                error!(job_id = %context.job.id, step = %step.name, reason = %reason, "Step failed; continuing");
                self.logs
                    .append(
                        context.job.id,
                        "warn",
                        &format!("step '{}' failed, continuing: {}", step.name, reason),
                    )
                    .await?;
                Ok(None)
            }
            StepErrorPolicy::Fail => Err(ExecutionError::StepFailed {
                step: step.name.clone(),
                reason,
            }),
            StepErrorPolicy::Retry { attempts, .. } => Err(ExecutionError::RetriesExhausted {
                step: step.name.clone(),
                attempts: attempts.saturating_add(1),
                reason,
            }),
        }
    }

    /// Push step counts from handlers that don't manage progress themselves.
    async fn bump_progress(&self, instance_id: Uuid, outcome: ActionOutcome) {
        let current = match self.jobs.get(instance_id).await {
            Ok(Some(row)) => row.progress,
            _ => return,
        };
        let total = current.total_urls + outcome.completed + outcome.failed;
        if let Err(e) = self
            .jobs
            .apply_progress_delta(
                instance_id,
                outcome.completed,
                outcome.failed,
                current.pending_urls,
                total,
            )
            .await
        {
            warn!(job_id = %instance_id, error = %e, "Progress update failed");
        }
    }

    /// Definition-level failure threshold, evaluated after each step.
    async fn check_tolerance(
        &self,
        instance_id: Uuid,
        definition: &JobDefinition,
    ) -> Result<(), ExecutionError> {
        let Some(tolerance) = definition.error_tolerance else {
            return Ok(());
        };

        let progress = self
            .jobs
            .get(instance_id)
            .await?
            .map(|row| row.progress)
            .unwrap_or_default();

        if progress.total_urls == 0 {
            return Ok(());
        }
        let ratio = progress.failed_urls as f64 / progress.total_urls as f64;
        if ratio > tolerance.max_failure_ratio {
            return Err(ExecutionError::ToleranceExceeded {
                ratio,
                tolerance: tolerance.max_failure_ratio,
            });
        }
        Ok(())
    }
}
