// Built-in store maintenance: prune old terminal runs (their logs and seen
// URLs cascade away) and refresh the query planner statistics.

use crate::errors::ExecutionError;
use crate::executor::registry::{ActionContext, ActionHandler, ActionOutcome};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

const DEFAULT_RETENTION_DAYS: i64 = 30;

pub struct DatabaseMaintenanceAction;

#[async_trait]
impl ActionHandler for DatabaseMaintenanceAction {
    fn name(&self) -> &'static str {
        "database_maintenance"
    }

    #[instrument(skip(self, context, config, cancel), fields(job_id = %context.job.id))]
    async fn execute(
        &self,
        context: &ActionContext,
        config: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome, ExecutionError> {
        let retention_days = config
            .get("retention_days")
            .and_then(Value::as_i64)
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        let pruned = context
            .jobs
            .prune_terminal_older_than(retention_days)
            .await?;

        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        sqlx::query("ANALYZE")
            .execute(context.store.pool())
            .await
            .map_err(crate::errors::StoreError::from)?;

        info!(pruned = pruned, retention_days, "Maintenance pass done");
        context
            .logs
            .append(
                context.job.id,
                "info",
                &format!("pruned {} terminal runs older than {} days", pruned, retention_days),
            )
            .await?;

        Ok(ActionOutcome {
            completed: pruned,
            failed: 0,
            counters_recorded: false,
        })
    }
}
