// Forward-only schema migrations.
//
// Each migration has an integer version, a name, and an up function; applied
// versions are recorded in `schema_migrations`. A migration runs inside a
// transaction and a failure rolls back and aborts startup. Migrations that
// rewrite a table (create-new, copy, drop-old, rename) must preserve all
// data not explicitly removed and recreate indexes and triggers afterwards.

use crate::errors::StoreError;
use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::{Connection, Executor, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

type MigrationFn = for<'c> fn(&'c mut SqliteConnection) -> BoxFuture<'c, Result<(), sqlx::Error>>;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: MigrationFn,
}

/// The forward-only migration list, ordered by version.
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "add_job_hierarchy",
            up: migrate_add_job_hierarchy,
        },
        Migration {
            version: 2,
            name: "document_detail_levels",
            up: migrate_document_detail_levels,
        },
        Migration {
            version: 3,
            name: "add_heartbeat_index",
            up: migrate_add_heartbeat_index,
        },
    ]
}

/// Apply every migration newer than the recorded version, each in its own
/// transaction.
pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut conn = pool.acquire().await.map_err(StoreError::from)?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(&mut *conn)
        .await
        .map_err(StoreError::from)?;

    for migration in migrations() {
        if applied.contains(&migration.version) {
            debug!(
                version = migration.version,
                name = migration.name,
                "Migration already applied"
            );
            continue;
        }

        info!(version = migration.version, name = migration.name, "Applying migration");

        let mut tx = conn.begin().await.map_err(|e| StoreError::MigrationFailed {
            version: migration.version,
            name: migration.name.to_string(),
            reason: e.to_string(),
        })?;

        // Rolls back on every early return until the commit below.
        (migration.up)(&mut *tx)
            .await
            .map_err(|e| StoreError::MigrationFailed {
                version: migration.version,
                name: migration.name.to_string(),
                reason: e.to_string(),
            })?;

        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::MigrationFailed {
                version: migration.version,
                name: migration.name.to_string(),
                reason: e.to_string(),
            })?;

        tx.commit().await.map_err(|e| StoreError::MigrationFailed {
            version: migration.version,
            name: migration.name.to_string(),
            reason: e.to_string(),
        })?;
    }

    Ok(())
}

/// v1: parent/child run hierarchy. Children are removed with their parent.
fn migrate_add_job_hierarchy(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<(), sqlx::Error>> {
    Box::pin(async move {
        conn.execute(sqlx::raw_sql(
            r#"
            ALTER TABLE jobs ADD COLUMN parent_id TEXT REFERENCES jobs(id) ON DELETE CASCADE;
            ALTER TABLE jobs ADD COLUMN depth INTEGER NOT NULL DEFAULT 0;
            CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs (parent_id);
            "#,
        ))
        .await?;
        Ok(())
    })
}

/// v2: add `detail_level` to documents via table rewrite, preserving rows and
/// recreating the source index and full-text triggers dropped with the old
/// table.
fn migrate_document_detail_levels(
    conn: &mut SqliteConnection,
) -> BoxFuture<'_, Result<(), sqlx::Error>> {
    Box::pin(async move {
        conn.execute(sqlx::raw_sql(
            r#"
            CREATE TABLE documents_new (
                id               TEXT PRIMARY KEY,
                source_type      TEXT NOT NULL,
                source_id        TEXT NOT NULL,
                title            TEXT NOT NULL DEFAULT '',
                content_markdown TEXT NOT NULL DEFAULT '',
                detail_level     TEXT NOT NULL DEFAULT 'full',
                metadata         TEXT NOT NULL DEFAULT '{}',
                url              TEXT NOT NULL DEFAULT '',
                synced           INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                UNIQUE (source_type, source_id)
            );

            INSERT INTO documents_new
                (id, source_type, source_id, title, content_markdown, detail_level,
                 metadata, url, synced, created_at, updated_at)
            SELECT id, source_type, source_id, title, content_markdown, 'full',
                   metadata, url, synced, created_at, updated_at
            FROM documents;

            DROP TABLE documents;
            ALTER TABLE documents_new RENAME TO documents;

            CREATE INDEX IF NOT EXISTS idx_documents_source ON documents (source_type);
            "#,
        ))
        .await?;

        // The old table took its FTS triggers with it.
        let fts_present: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'documents_fts'",
        )
        .fetch_one(&mut *conn)
        .await?;

        if fts_present > 0 {
            conn.execute(sqlx::raw_sql(super::schema::FTS_TRIGGERS))
                .await?;
            // The drop bypassed the delete triggers; resync the mirror from
            // the rewritten content table.
            sqlx::query("INSERT INTO documents_fts (documents_fts) VALUES ('rebuild')")
                .execute(&mut *conn)
                .await?;
        } else {
            warn!("FTS5 mirror absent; skipping trigger recreation");
        }

        Ok(())
    })
}

/// v3: the stale-run sweep scans running rows by heartbeat.
fn migrate_add_heartbeat_index(
    conn: &mut SqliteConnection,
) -> BoxFuture<'_, Result<(), sqlx::Error>> {
    Box::pin(async move {
        conn.execute(sqlx::raw_sql(
            "CREATE INDEX IF NOT EXISTS idx_jobs_heartbeat ON jobs (status, last_heartbeat);",
        ))
        .await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    #[tokio::test]
    async fn test_migrations_apply_once() {
        let store = Store::open_in_memory().await.unwrap();
        crate::db::schema::install(store.pool()).await.unwrap();

        run(store.pool()).await.unwrap();
        run(store.pool()).await.unwrap();

        let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(applied, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_rewrite_preserves_documents() {
        let store = Store::open_in_memory().await.unwrap();
        crate::db::schema::install(store.pool()).await.unwrap();

        sqlx::query(
            "INSERT INTO documents (id, source_type, source_id, title, content_markdown, created_at, updated_at)
             VALUES ('d1', 'web', 'page-1', 'Title', 'Body', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        run(store.pool()).await.unwrap();

        let (title, detail): (String, String) = sqlx::query_as(
            "SELECT title, detail_level FROM documents WHERE source_type = 'web' AND source_id = 'page-1'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(title, "Title");
        assert_eq!(detail, "full");
    }

    #[tokio::test]
    async fn test_parent_cascade_after_migration() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();

        sqlx::raw_sql(
            "INSERT INTO jobs (id, status, progress, created_at) VALUES ('p', 'pending', '{}', '2024-01-01T00:00:00Z');
             INSERT INTO jobs (id, parent_id, status, progress, created_at) VALUES ('c', 'p', 'pending', '{}', '2024-01-01T00:00:00Z');",
        )
        .execute(store.pool())
        .await
        .unwrap();

        sqlx::query("DELETE FROM jobs WHERE id = 'p'")
            .execute(store.pool())
            .await
            .unwrap();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
