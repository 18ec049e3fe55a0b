// Bounded crawl worker pool.
//
// One pool per crawl step. Workers share an in-memory frontier; duplicate
// URLs within a run are collapsed there. The store-backed seen-URL claim is
// taken right before fetching, which makes the fetch at-most-once per job
// across workers AND across resumed runs: a restart re-seeds the frontier,
// loses the claim for everything already fetched, and crawls only the rest.
// The pool stops when the frontier drains, the page cap is reached, or the
// run is cancelled. One URL failing never stops the pool.

use crate::crawler::fetcher::{self, ExtractedPage};
use crate::db::repositories::document::DocumentRepository;
use crate::db::repositories::job::JobRepository;
use crate::db::repositories::job_log::JobLogRepository;
use crate::db::repositories::seen_url::SeenUrlRepository;
use crate::errors::CrawlError;
use crate::models::{DetailLevel, Document};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

/// Inputs of one crawl step.
#[derive(Debug, Clone)]
pub struct CrawlParams {
    pub seed_urls: Vec<String>,
    pub include_patterns: Vec<Regex>,
    pub exclude_patterns: Vec<Regex>,
    pub max_depth: u32,
    pub max_pages: usize,
    pub concurrency: usize,
    pub follow_links: bool,
    pub source_type: String,
    pub fetch_timeout: Duration,
    pub user_agent: String,
}

impl CrawlParams {
    /// Assemble params from a step config, falling back to the instance's
    /// seed URLs and the crawler defaults.
    pub fn from_step_config(
        config: &Map<String, Value>,
        instance_seed_urls: &[String],
        source_type: &str,
        defaults: &crate::config::CrawlerConfig,
    ) -> Result<Self, CrawlError> {
        let seed_urls = config
            .get("seed_urls")
            .or_else(|| config.get("start_urls"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .unwrap_or_else(|| instance_seed_urls.to_vec());

        let include_patterns = compile_patterns(config.get("include_patterns"))?;
        let exclude_patterns = compile_patterns(config.get("exclude_patterns"))?;

        Ok(Self {
            seed_urls,
            include_patterns,
            exclude_patterns,
            max_depth: config
                .get("max_depth")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            max_pages: config
                .get("max_pages")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(defaults.default_max_pages),
            concurrency: config
                .get("concurrency")
                .and_then(Value::as_u64)
                .map(|v| (v as usize).max(1))
                .unwrap_or(defaults.default_concurrency),
            follow_links: config
                .get("follow_links")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            source_type: if source_type.is_empty() {
                "web".to_string()
            } else {
                source_type.to_string()
            },
            fetch_timeout: Duration::from_secs(defaults.fetch_timeout_seconds),
            user_agent: defaults.user_agent.clone(),
        })
    }

    fn url_allowed(&self, url: &Url) -> bool {
        let text = url.as_str();
        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(text))
        {
            return false;
        }
        !self.exclude_patterns.iter().any(|p| p.is_match(text))
    }
}

fn compile_patterns(value: Option<&Value>) -> Result<Vec<Regex>, CrawlError> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    items
        .iter()
        .filter_map(|v| v.as_str())
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| CrawlError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Counters reported back to the executing step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlOutcome {
    pub completed: u64,
    pub failed: u64,
}

/// How one dequeued URL ended.
enum UrlDisposition {
    Fetched { success: bool },
    AlreadyClaimed,
}

/// Shared frontier. `in_flight` keeps drained-queue detection honest while
/// fetches are still outstanding; `enqueued` collapses duplicates within
/// the run before they reach the queue.
#[derive(Default)]
struct Frontier {
    queue: VecDeque<(Url, u32)>,
    enqueued: HashSet<String>,
    in_flight: usize,
    fetched: usize,
    total: usize,
    completed: u64,
    failed: u64,
}

pub struct CrawlerPool {
    jobs: Arc<JobRepository>,
    documents: Arc<DocumentRepository>,
    seen: Arc<SeenUrlRepository>,
    logs: Arc<JobLogRepository>,
}

impl CrawlerPool {
    pub fn new(
        jobs: Arc<JobRepository>,
        documents: Arc<DocumentRepository>,
        seen: Arc<SeenUrlRepository>,
        logs: Arc<JobLogRepository>,
    ) -> Self {
        Self {
            jobs,
            documents,
            seen,
            logs,
        }
    }

    /// Crawl until the frontier drains, the page cap hits, or the token
    /// cancels.
    #[instrument(skip(self, params, cancel), fields(job_id = %job_id, seeds = params.seed_urls.len()))]
    pub async fn run(
        &self,
        job_id: Uuid,
        params: CrawlParams,
        cancel: CancellationToken,
    ) -> Result<CrawlOutcome, CrawlError> {
        let client = fetcher::build_client(&params.user_agent, params.fetch_timeout)?;
        let params = Arc::new(params);
        let frontier = Arc::new(Mutex::new(Frontier::default()));
        let notify = Arc::new(Notify::new());

        {
            let mut seeded = frontier.lock().await;
            for raw in &params.seed_urls {
                let url = match Url::parse(raw) {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(job_id = %job_id, url = %raw, error = %e, "Invalid seed URL; skipping");
                        continue;
                    }
                };
                if !params.url_allowed(&url) {
                    debug!(job_id = %job_id, url = %url, "Seed URL rejected by patterns");
                    continue;
                }
                if seeded.enqueued.insert(url.to_string()) {
                    seeded.queue.push_back((url, 0));
                    seeded.total += 1;
                }
            }
        }

        let mut workers = JoinSet::new();
        for worker_index in 0..params.concurrency.max(1) {
            let worker = Worker {
                job_id,
                client: client.clone(),
                params: Arc::clone(&params),
                frontier: Arc::clone(&frontier),
                notify: Arc::clone(&notify),
                cancel: cancel.clone(),
                jobs: Arc::clone(&self.jobs),
                documents: Arc::clone(&self.documents),
                seen: Arc::clone(&self.seen),
                logs: Arc::clone(&self.logs),
            };
            workers.spawn(async move { worker.run(worker_index).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(job_id = %job_id, error = %e, "Crawl worker panicked");
            }
        }

        let state = frontier.lock().await;
        let outcome = CrawlOutcome {
            completed: state.completed,
            failed: state.failed,
        };
        info!(
            job_id = %job_id,
            completed = outcome.completed,
            failed = outcome.failed,
            enqueued = state.enqueued.len(),
            "Crawl finished"
        );
        Ok(outcome)
    }
}

struct Worker {
    job_id: Uuid,
    client: reqwest::Client,
    params: Arc<CrawlParams>,
    frontier: Arc<Mutex<Frontier>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    jobs: Arc<JobRepository>,
    documents: Arc<DocumentRepository>,
    seen: Arc<SeenUrlRepository>,
    logs: Arc<JobLogRepository>,
}

impl Worker {
    async fn run(&self, index: usize) {
        debug!(job_id = %self.job_id, worker = index, "Crawl worker started");

        loop {
            let Some((url, depth)) = self.next_item().await else {
                break;
            };

            // The store claim is the at-most-once gate: losing it means some
            // worker (possibly of an earlier, interrupted run) already took
            // responsibility for this URL.
            let claimed = match self.seen.mark_url_seen(self.job_id, url.as_str()).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(job_id = %self.job_id, url = %url, error = %e, "Seen-URL claim failed");
                    true
                }
            };

            let disposition = if !claimed {
                debug!(job_id = %self.job_id, url = %url, "URL already claimed; skipping");
                UrlDisposition::AlreadyClaimed
            } else {
                match self.process(&url, depth).await {
                    Ok(links) => {
                        // Links enter the frontier before this URL retires so
                        // waiting workers never observe a falsely drained queue.
                        if !links.is_empty() {
                            self.enqueue_links(links, depth + 1).await;
                        }
                        UrlDisposition::Fetched { success: true }
                    }
                    Err(e) => {
                        warn!(job_id = %self.job_id, url = %url, error = %e, "URL failed");
                        if let Err(log_err) = self
                            .logs
                            .append(self.job_id, "warn", &format!("fetch failed: {}: {}", url, e))
                            .await
                        {
                            debug!(error = %log_err, "Could not append crawl log");
                        }
                        UrlDisposition::Fetched { success: false }
                    }
                }
            };

            self.retire(&url, disposition).await;
            self.notify.notify_waiters();
        }

        debug!(job_id = %self.job_id, worker = index, "Crawl worker stopped");
    }

    /// Pop the next URL, waiting while other workers are still fetching.
    /// Returns None on cancellation, page cap, or a drained frontier.
    async fn next_item(&self) -> Option<(Url, u32)> {
        loop {
            if self.cancel.is_cancelled() {
                self.notify.notify_waiters();
                return None;
            }

            {
                let mut state = self.frontier.lock().await;
                if state.fetched >= self.params.max_pages {
                    self.notify.notify_waiters();
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.in_flight += 1;
                    return Some(item);
                }
                if state.in_flight == 0 {
                    // Nothing queued, nothing outstanding: done.
                    self.notify.notify_waiters();
                    return None;
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// Fetch, extract, and persist one URL; returns the outbound links to
    /// consider for the frontier.
    async fn process(&self, url: &Url, depth: u32) -> Result<Vec<Url>, CrawlError> {
        let body = fetcher::fetch_body(&self.client, url).await?;

        let follow = self.params.follow_links && depth < self.params.max_depth;
        let ExtractedPage { title, text, links } = fetcher::extract_page(url, &body, follow);

        let mut document = Document::new(&self.params.source_type, url.as_str());
        document.title = title;
        document.content_markdown = text;
        document.detail_level = DetailLevel::Full;
        document.url = url.to_string();
        document.metadata = json!({
            "crawl_job_id": self.job_id.to_string(),
            "depth": depth,
        });
        self.documents.upsert(&document).await?;

        Ok(links)
    }

    /// Push pattern-approved, not-yet-queued links onto the frontier.
    async fn enqueue_links(&self, links: Vec<Url>, depth: u32) {
        let mut state = self.frontier.lock().await;
        for url in links {
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.params.url_allowed(&url) {
                continue;
            }
            if state.fetched + state.queue.len() + state.in_flight >= self.params.max_pages {
                return;
            }
            if state.enqueued.insert(url.to_string()) {
                state.queue.push_back((url, depth));
                state.total += 1;
            }
        }
    }

    /// Retire one URL and push the counter delta through the store.
    async fn retire(&self, url: &Url, disposition: UrlDisposition) {
        let (completed_delta, failed_delta, pending, total) = {
            let mut state = self.frontier.lock().await;
            state.in_flight -= 1;

            let (completed_delta, failed_delta) = match disposition {
                UrlDisposition::Fetched { success: true } => {
                    state.fetched += 1;
                    state.completed += 1;
                    (1, 0)
                }
                UrlDisposition::Fetched { success: false } => {
                    state.fetched += 1;
                    state.failed += 1;
                    (0, 1)
                }
                UrlDisposition::AlreadyClaimed => {
                    // Neither completed nor failed; shrink the total so the
                    // percentage still converges to 100.
                    state.total = state.total.saturating_sub(1);
                    (0, 0)
                }
            };

            (
                completed_delta,
                failed_delta,
                (state.queue.len() + state.in_flight) as u64,
                state.total as u64,
            )
        };

        if let Err(e) = self
            .jobs
            .apply_progress_delta(self.job_id, completed_delta, failed_delta, pending, total)
            .await
        {
            warn!(job_id = %self.job_id, url = %url, error = %e, "Progress update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlerConfig;

    fn defaults() -> CrawlerConfig {
        CrawlerConfig {
            user_agent: "quaero-test/0".to_string(),
            fetch_timeout_seconds: 5,
            default_concurrency: 2,
            default_max_pages: 50,
        }
    }

    #[test]
    fn test_params_from_step_config() {
        let config: Map<String, Value> = serde_json::from_str(
            r#"{
                "start_urls": ["https://example.test/"],
                "max_depth": 2,
                "concurrency": 8,
                "max_pages": 10,
                "follow_links": false,
                "include_patterns": ["example\\.test"],
                "exclude_patterns": ["\\.pdf$"]
            }"#,
        )
        .unwrap();

        let params = CrawlParams::from_step_config(&config, &[], "wiki", &defaults()).unwrap();
        assert_eq!(params.seed_urls, vec!["https://example.test/"]);
        assert_eq!(params.max_depth, 2);
        assert_eq!(params.concurrency, 8);
        assert_eq!(params.max_pages, 10);
        assert!(!params.follow_links);
        assert_eq!(params.source_type, "wiki");
    }

    #[test]
    fn test_params_fall_back_to_instance_seeds_and_defaults() {
        let config = Map::new();
        let seeds = vec!["https://fallback.test/".to_string()];
        let params = CrawlParams::from_step_config(&config, &seeds, "", &defaults()).unwrap();
        assert_eq!(params.seed_urls, seeds);
        assert_eq!(params.concurrency, 2);
        assert_eq!(params.max_pages, 50);
        assert_eq!(params.source_type, "web");
        assert!(params.follow_links);
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let config: Map<String, Value> =
            serde_json::from_str(r#"{ "include_patterns": ["["] }"#).unwrap();
        let err = CrawlParams::from_step_config(&config, &[], "web", &defaults()).unwrap_err();
        assert!(matches!(err, CrawlError::InvalidPattern { .. }));
    }

    #[test]
    fn test_url_filtering() {
        let config: Map<String, Value> = serde_json::from_str(
            r#"{
                "include_patterns": ["example\\.test"],
                "exclude_patterns": ["/private/"]
            }"#,
        )
        .unwrap();
        let params = CrawlParams::from_step_config(&config, &[], "web", &defaults()).unwrap();

        let allowed = Url::parse("https://example.test/page").unwrap();
        let excluded = Url::parse("https://example.test/private/page").unwrap();
        let foreign = Url::parse("https://other.test/page").unwrap();
        assert!(params.url_allowed(&allowed));
        assert!(!params.url_allowed(&excluded));
        assert!(!params.url_allowed(&foreign));
    }
}
