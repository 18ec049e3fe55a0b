// Embedded store wrapper: one SQLite file, one connection.
//
// The single-connection pool is the primary write-concurrency control; the
// store does not tolerate concurrent writers. Repositories add a per-entity
// mutex on top so their multi-statement mutations stay serialized.

use crate::config::DatabaseConfig;
use crate::errors::StoreError;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Store owns the process-wide connection to the embedded database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the store file, applying pragmas from config.
    ///
    /// If the reset flag is set and `environment` is `"development"`, the
    /// store file and its journal sidecars are deleted first. A reset flag
    /// in any other environment logs a warning and is ignored.
    #[instrument(skip(config), fields(path = %config.path))]
    pub async fn open(config: &DatabaseConfig, environment: &str) -> Result<Self, StoreError> {
        if config.reset {
            if environment == "development" {
                reset_store_files(&config.path);
            } else {
                warn!(
                    environment = environment,
                    "Store reset requested outside development; ignoring"
                );
            }
        }

        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
            }
        }

        let journal_mode = if config.wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            // Negative cache_size is the KiB convention of the pragma.
            .pragma("cache_size", format!("-{}", config.cache_size_kib));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to open store");
                StoreError::ConnectionFailed(e.to_string())
            })?;

        info!(
            path = %config.path,
            wal = config.wal,
            cache_size_kib = config.cache_size_kib,
            "Store opened"
        );

        Ok(Self { pool })
    }

    /// In-memory store for tests; same single-connection discipline.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Install the baseline schema and apply pending migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        super::schema::install(&self.pool).await?;
        super::migrations::run(&self.pool).await
    }

    /// The underlying pool, used by repositories to execute queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection gracefully during shutdown.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        info!("Closing store");
        self.pool.close().await;
    }
}

/// Delete the store file plus `-wal` / `-shm` sidecars.
fn reset_store_files(path: &str) {
    for candidate in [
        path.to_string(),
        format!("{}-wal", path),
        format!("{}-shm", path),
    ] {
        match std::fs::remove_file(&candidate) {
            Ok(()) => info!(path = %candidate, "Removed store file for reset"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %candidate, error = %e, "Failed to remove store file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(path: &str) -> DatabaseConfig {
        DatabaseConfig {
            path: path.to_string(),
            cache_size_kib: 2_000,
            busy_timeout_ms: 1_000,
            wal: false,
            reset: false,
        }
    }

    #[tokio::test]
    async fn test_open_and_migrate_in_memory() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();

        // Migrations are recorded and re-running is a no-op.
        store.migrate().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(count > 0);
    }

    #[tokio::test]
    async fn test_reset_only_in_development() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path_str = path.to_str().unwrap();

        let store = Store::open(&file_config(path_str), "development")
            .await
            .unwrap();
        store.migrate().await.unwrap();
        sqlx::query("INSERT INTO key_values (id, key, key_normalized, value, created_at, updated_at) VALUES ('a', 'K', 'k', 'v', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')")
            .execute(store.pool())
            .await
            .unwrap();
        store.close().await;

        // Reset in production is ignored; the row survives.
        let mut config = file_config(path_str);
        config.reset = true;
        let store = Store::open(&config, "production").await.unwrap();
        store.migrate().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM key_values")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
        store.close().await;

        // Reset in development wipes the file.
        let store = Store::open(&config, "development").await.unwrap();
        store.migrate().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM key_values")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
        store.close().await;
    }
}
