// Per-job URL deduplication.
//
// The `(job_id, url)` primary key plus INSERT OR IGNORE makes the claim
// atomic at the store: the first caller wins, every later caller for the
// same pair observes "already seen". This is the only coordination channel
// between crawl workers.

use crate::db::Store;
use crate::errors::StoreError;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{instrument, warn};
use uuid::Uuid;

pub struct SeenUrlRepository {
    store: Store,
    write_lock: Mutex<()>,
}

impl SeenUrlRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Claim a URL for a job. Returns true when this caller inserted the
    /// row (first claim), false when some worker already had it.
    ///
    /// A store error reports the URL as newly added: duplicate fetching is
    /// recoverable, dropped work is not.
    #[instrument(skip(self))]
    pub async fn mark_url_seen(&self, job_id: Uuid, url: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO seen_urls (job_id, url, created_at) VALUES (?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(url)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) => {
                warn!(job_id = %job_id, url = url, error = %e, "Seen-URL insert failed; treating as newly added");
                Ok(true)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn count_for_job(&self, job_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_urls WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobInstance, JobProgress, JobStatus};
    use serde_json::{Map, Value};

    async fn setup() -> (SeenUrlRepository, Uuid) {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();

        let jobs = crate::db::repositories::job::JobRepository::new(store.clone());
        let instance = JobInstance {
            id: Uuid::new_v4(),
            parent_id: None,
            definition_id: None,
            job_type: "crawler".to_string(),
            name: "dedup".to_string(),
            description: String::new(),
            source_type: String::new(),
            entity_type: String::new(),
            config: Map::new(),
            source_config_snapshot: Value::Object(Map::new()),
            auth_snapshot: None,
            refresh_source: false,
            seed_urls: vec![],
            status: JobStatus::Pending,
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
        };
        jobs.create(&instance).await.unwrap();

        (SeenUrlRepository::new(store), instance.id)
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let (repo, job_id) = setup().await;
        assert!(repo.mark_url_seen(job_id, "https://a.test/").await.unwrap());
        assert!(!repo.mark_url_seen(job_id, "https://a.test/").await.unwrap());
        assert_eq!(repo.count_for_job(job_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_distinct_urls_both_claimed() {
        let (repo, job_id) = setup().await;
        assert!(repo.mark_url_seen(job_id, "https://a.test/").await.unwrap());
        assert!(repo.mark_url_seen(job_id, "https://b.test/").await.unwrap());
        assert_eq!(repo.count_for_job(job_id).await.unwrap(), 2);
    }
}
