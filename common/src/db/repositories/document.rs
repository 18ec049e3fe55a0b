// Document repository.

use super::{decode_json_or_default, parse_uuid};
use crate::db::Store;
use crate::errors::StoreError;
use crate::models::{DetailLevel, Document};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

const COLUMNS: &str = "id, source_type, source_id, title, content_markdown, detail_level, \
                       metadata, url, synced, created_at, updated_at";

/// Repository for normalized content rows, keyed by `(source_type, source_id)`.
pub struct DocumentRepository {
    store: Store,
    write_lock: Mutex<()>,
}

impl DocumentRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Upsert by natural key. A `full` row never regresses to `summary`:
    /// summary writes over full content keep the existing title, body, and
    /// detail level.
    #[instrument(skip(self, document), fields(source_type = %document.source_type, source_id = %document.source_id))]
    pub async fn upsert(&self, document: &Document) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let metadata =
            serde_json::to_string(&document.metadata).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(&format!(
            "INSERT INTO documents ({COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (source_type, source_id) DO UPDATE SET
                 title = CASE
                     WHEN documents.detail_level = 'full' AND excluded.detail_level = 'summary'
                     THEN documents.title ELSE excluded.title END,
                 content_markdown = CASE
                     WHEN documents.detail_level = 'full' AND excluded.detail_level = 'summary'
                     THEN documents.content_markdown ELSE excluded.content_markdown END,
                 detail_level = CASE
                     WHEN documents.detail_level = 'full'
                     THEN 'full' ELSE excluded.detail_level END,
                 metadata = excluded.metadata,
                 url = excluded.url,
                 synced = excluded.synced,
                 updated_at = excluded.updated_at"
        ))
        .bind(document.id.to_string())
        .bind(&document.source_type)
        .bind(&document.source_id)
        .bind(&document.title)
        .bind(&document.content_markdown)
        .bind(document.detail_level.to_string())
        .bind(metadata)
        .bind(&document.url)
        .bind(document.synced)
        .bind(document.created_at)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;

        debug!(source_id = %document.source_id, "Document upserted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_by_natural_key(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM documents WHERE source_type = ? AND source_id = ?"
        ))
        .bind(source_type)
        .bind(source_id)
        .fetch_optional(self.store.pool())
        .await?;

        row.map(map_document).transpose()
    }

    #[instrument(skip(self))]
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM documents ORDER BY updated_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter().map(map_document).collect()
    }

    #[instrument(skip(self))]
    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }

    /// Document counts grouped by source type, for the corpus summary.
    #[instrument(skip(self))]
    pub async fn count_by_source_type(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT source_type, COUNT(*) AS n FROM documents
             GROUP BY source_type ORDER BY source_type",
        )
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let source_type: String = row.try_get("source_type")?;
                let n: i64 = row.try_get("n")?;
                Ok((source_type, n))
            })
            .collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.to_string())
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Document not found: {}", id)));
        }
        Ok(())
    }
}

fn map_document(row: SqliteRow) -> Result<Document, StoreError> {
    let id: String = row.try_get("id")?;
    let detail: String = row.try_get("detail_level")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(Document {
        id: parse_uuid(&id, "documents.id")?,
        source_type: row.try_get("source_type")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        content_markdown: row.try_get("content_markdown")?,
        detail_level: DetailLevel::from_str(&detail).unwrap_or_default(),
        metadata: decode_json_or_default(&metadata, "documents.metadata"),
        url: row.try_get("url")?,
        synced: row.try_get("synced")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> DocumentRepository {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        DocumentRepository::new(store)
    }

    fn doc(source_id: &str, detail: DetailLevel, content: &str) -> Document {
        let mut d = Document::new("web", source_id);
        d.title = format!("{} title", source_id);
        d.content_markdown = content.to_string();
        d.detail_level = detail;
        d
    }

    #[tokio::test]
    async fn test_upsert_round_trip() {
        let repo = repo().await;
        repo.upsert(&doc("p1", DetailLevel::Full, "body"))
            .await
            .unwrap();

        let loaded = repo.get_by_natural_key("web", "p1").await.unwrap().unwrap();
        assert_eq!(loaded.content_markdown, "body");
        assert_eq!(loaded.detail_level, DetailLevel::Full);
    }

    #[tokio::test]
    async fn test_full_never_regresses_to_summary() {
        let repo = repo().await;
        repo.upsert(&doc("p1", DetailLevel::Full, "full body"))
            .await
            .unwrap();
        repo.upsert(&doc("p1", DetailLevel::Summary, "short"))
            .await
            .unwrap();

        let loaded = repo.get_by_natural_key("web", "p1").await.unwrap().unwrap();
        assert_eq!(loaded.detail_level, DetailLevel::Full);
        assert_eq!(loaded.content_markdown, "full body");
    }

    #[tokio::test]
    async fn test_full_write_upgrades_summary() {
        let repo = repo().await;
        repo.upsert(&doc("p1", DetailLevel::Summary, "short"))
            .await
            .unwrap();
        repo.upsert(&doc("p1", DetailLevel::Full, "full body"))
            .await
            .unwrap();

        let loaded = repo.get_by_natural_key("web", "p1").await.unwrap().unwrap();
        assert_eq!(loaded.detail_level, DetailLevel::Full);
        assert_eq!(loaded.content_markdown, "full body");
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_by_source_type() {
        let repo = repo().await;
        repo.upsert(&doc("p1", DetailLevel::Full, "a")).await.unwrap();
        repo.upsert(&doc("p2", DetailLevel::Full, "b")).await.unwrap();
        let mut issue = Document::new("issue", "QA-1");
        issue.content_markdown = "c".to_string();
        repo.upsert(&issue).await.unwrap();

        let counts = repo.count_by_source_type().await.unwrap();
        assert_eq!(counts, vec![("issue".to_string(), 1), ("web".to_string(), 2)]);
    }
}
