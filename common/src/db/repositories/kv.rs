// Key/value repository backing `{placeholder}` resolution.

use super::parse_uuid;
use crate::db::Store;
use crate::errors::StoreError;
use crate::models::{normalize_key, KeyValueEntry};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, instrument};

const COLUMNS: &str = "id, key, key_normalized, value, description, created_at, updated_at";

/// Repository for kv entries. Uniqueness and lookup use the normalized key;
/// the original casing is preserved for display.
pub struct KeyValueRepository {
    store: Store,
    write_lock: Mutex<()>,
}

impl KeyValueRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Upsert by normalized key. The later write wins; `created_at` of the
    /// original row is preserved.
    #[instrument(skip(self, entry), fields(key = %entry.key))]
    pub async fn upsert(&self, entry: &KeyValueEntry) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(&format!(
            "INSERT INTO key_values ({COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (key_normalized) DO UPDATE SET
                 key = excluded.key,
                 value = excluded.value,
                 description = excluded.description,
                 updated_at = excluded.updated_at"
        ))
        .bind(entry.id.to_string())
        .bind(&entry.key)
        .bind(entry.normalized_key())
        .bind(&entry.value)
        .bind(&entry.description)
        .bind(entry.created_at)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;

        Ok(())
    }

    /// Lookup by key in any casing.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<KeyValueEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM key_values WHERE key_normalized = ?"
        ))
        .bind(normalize_key(key))
        .fetch_optional(self.store.pool())
        .await?;

        row.map(|r| map_entry(&r)).transpose()
    }

    /// All entries as `normalized key → value`, the shape the resolver wants.
    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> Result<HashMap<String, String>, StoreError> {
        let rows = sqlx::query("SELECT key_normalized, value FROM key_values")
            .fetch_all(self.store.pool())
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key_normalized")?;
            let value: String = row.try_get("value")?;
            map.insert(key, value);
        }
        Ok(map)
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<KeyValueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM key_values ORDER BY key_normalized"
        ))
        .fetch_all(self.store.pool())
        .await?;

        rows.iter().map(map_entry).collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM key_values WHERE key_normalized = ?")
            .bind(normalize_key(key))
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Variable not found: {}", key)));
        }

        info!(key = key, "Variable deleted");
        Ok(())
    }
}

fn map_entry(row: &SqliteRow) -> Result<KeyValueEntry, StoreError> {
    let id: String = row.try_get("id")?;
    Ok(KeyValueEntry {
        id: parse_uuid(&id, "key_values.id")?,
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
