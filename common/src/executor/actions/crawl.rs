// The crawl action: bridges a crawl-typed step to the worker pool.

use crate::crawler::{CrawlParams, CrawlerPool};
use crate::errors::ExecutionError;
use crate::executor::registry::{ActionContext, ActionHandler, ActionOutcome};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub struct CrawlAction;

#[async_trait]
impl ActionHandler for CrawlAction {
    fn name(&self) -> &'static str {
        "crawl"
    }

    #[instrument(skip(self, context, config, cancel), fields(job_id = %context.job.id))]
    async fn execute(
        &self,
        context: &ActionContext,
        config: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome, ExecutionError> {
        let params = CrawlParams::from_step_config(
            config,
            &context.job.seed_urls,
            &context.job.source_type,
            &context.crawler,
        )
        .map_err(|e| ExecutionError::ActionFailed(e.to_string()))?;

        let pool = CrawlerPool::new(
            Arc::clone(&context.jobs),
            Arc::clone(&context.documents),
            Arc::clone(&context.seen),
            Arc::clone(&context.logs),
        );

        let outcome = pool
            .run(context.job.id, params, cancel.clone())
            .await
            .map_err(|e| ExecutionError::ActionFailed(e.to_string()))?;

        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        Ok(ActionOutcome {
            completed: outcome.completed,
            failed: outcome.failed,
            // The pool already pushed these through the progress counters.
            counters_recorded: true,
        })
    }
}
