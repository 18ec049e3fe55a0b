// Built-in corpus summary: a per-source document census written back into
// the corpus as a summary-level document.

use crate::errors::ExecutionError;
use crate::executor::registry::{ActionContext, ActionHandler, ActionOutcome};
use crate::models::{DetailLevel, Document};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub struct CorpusSummaryAction;

#[async_trait]
impl ActionHandler for CorpusSummaryAction {
    fn name(&self) -> &'static str {
        "corpus_summary"
    }

    #[instrument(skip(self, context, _config, cancel), fields(job_id = %context.job.id))]
    async fn execute(
        &self,
        context: &ActionContext,
        _config: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome, ExecutionError> {
        let counts = context.documents.count_by_source_type().await?;
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let total: i64 = counts.iter().map(|(_, n)| n).sum();
        let mut body = format!("# Corpus summary\n\nTotal documents: {}\n\n", total);
        for (source_type, count) in &counts {
            body.push_str(&format!("- {}: {}\n", source_type, count));
        }

        let mut document = Document::new("system", "corpus-summary");
        document.title = "Corpus summary".to_string();
        document.content_markdown = body;
        document.detail_level = DetailLevel::Summary;
        document.metadata = json!({
            "generated_by": context.job.id.to_string(),
            "sources": counts.len(),
            "total": total,
        });
        context.documents.upsert(&document).await?;

        Ok(ActionOutcome {
            completed: 1,
            failed: 0,
            counters_recorded: false,
        })
    }
}
