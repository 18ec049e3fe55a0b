// Action registry: named handlers the executor dispatches steps to.
//
// The engine treats an action as opaque; everything a handler may touch
// arrives through the context, and cancellation arrives through the token.

use crate::config::CrawlerConfig;
use crate::db::repositories::document::DocumentRepository;
use crate::db::repositories::job::JobRepository;
use crate::db::repositories::job_log::JobLogRepository;
use crate::db::repositories::seen_url::SeenUrlRepository;
use crate::db::Store;
use crate::errors::ExecutionError;
use crate::models::JobInstance;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a handler may need while executing one step of one run.
pub struct ActionContext {
    pub job: JobInstance,
    pub store: Store,
    pub jobs: Arc<JobRepository>,
    pub documents: Arc<DocumentRepository>,
    pub seen: Arc<SeenUrlRepository>,
    pub logs: Arc<JobLogRepository>,
    pub crawler: CrawlerConfig,
}

/// Result counts of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub completed: u64,
    pub failed: u64,
    /// True when the handler already pushed its counts through the job's
    /// progress (the crawl pool does); the executor then skips its own
    /// progress update for the step.
    pub counters_recorded: bool,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Registry key referenced by step `action` fields.
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        context: &ActionContext,
        config: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome, ExecutionError>;
}

/// Name-keyed handler registry; one per process.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<&'static str, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::actions::crawl::CrawlAction));
        registry.register(Arc::new(
            super::actions::maintenance::DatabaseMaintenanceAction,
        ));
        registry.register(Arc::new(super::actions::summary::CorpusSummaryAction));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ActionRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["corpus_summary", "crawl", "database_maintenance"]
        );
        assert!(registry.get("crawl").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
