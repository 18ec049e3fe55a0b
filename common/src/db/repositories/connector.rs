// Connector repository.

use super::{decode_json_or_default, parse_uuid};
use crate::db::Store;
use crate::errors::StoreError;
use crate::models::{normalize_key, Connector, ConnectorType};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

const COLUMNS: &str = "id, name, name_normalized, type, config, created_at, updated_at";

/// Repository for third-party integration configs, one row per
/// case-insensitively unique name.
pub struct ConnectorRepository {
    store: Store,
    write_lock: Mutex<()>,
}

impl ConnectorRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    #[instrument(skip(self, connector), fields(name = %connector.name))]
    pub async fn upsert(&self, connector: &Connector) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let config =
            serde_json::to_string(&connector.config).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(&format!(
            "INSERT INTO connectors ({COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (name_normalized) DO UPDATE SET
                 name = excluded.name,
                 type = excluded.type,
                 config = excluded.config,
                 updated_at = excluded.updated_at"
        ))
        .bind(connector.id.to_string())
        .bind(&connector.name)
        .bind(connector.normalized_name())
        .bind(connector.connector_type.to_string())
        .bind(config)
        .bind(connector.created_at)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;

        info!(name = %connector.name, connector_type = %connector.connector_type, "Connector saved");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Connector>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM connectors WHERE name_normalized = ?"
        ))
        .bind(normalize_key(name))
        .fetch_optional(self.store.pool())
        .await?;

        row.map(map_connector).transpose()
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Connector>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM connectors ORDER BY name_normalized"
        ))
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter().map(map_connector).collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM connectors WHERE name_normalized = ?")
            .bind(normalize_key(name))
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Connector not found: {}", name)));
        }

        info!(name = name, "Connector deleted");
        Ok(())
    }
}

fn map_connector(row: SqliteRow) -> Result<Connector, StoreError> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("type")?;
    let config: String = row.try_get("config")?;

    let connector_type = ConnectorType::from_str(&kind).unwrap_or_else(|_| {
        warn!(kind = %kind, "Unknown connector type in store; treating as web");
        ConnectorType::Web
    });

    Ok(Connector {
        id: parse_uuid(&id, "connectors.id")?,
        name: row.try_get("name")?,
        connector_type,
        config: decode_json_or_default(&config, "connectors.config"),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    async fn repo() -> ConnectorRepository {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        ConnectorRepository::new(store)
    }

    fn jira_connector(name: &str) -> Connector {
        let now = Utc::now();
        Connector {
            id: Uuid::new_v4(),
            name: name.to_string(),
            connector_type: ConnectorType::Jira,
            config: json!({ "base_url": "https://issues.example.com" }),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_upsert_round_trip() {
        let repo = repo().await;
        repo.upsert(&jira_connector("Team-Jira")).await.unwrap();

        let loaded = repo.get_by_name("team-jira").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Team-Jira");
        assert_eq!(loaded.connector_type, ConnectorType::Jira);
        assert_eq!(loaded.config["base_url"], "https://issues.example.com");
    }

    #[tokio::test]
    async fn test_case_insensitive_uniqueness() {
        let repo = repo().await;
        repo.upsert(&jira_connector("jira")).await.unwrap();
        repo.upsert(&jira_connector("JIRA")).await.unwrap();
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_config_defaults_to_null() {
        let repo = repo().await;
        repo.upsert(&jira_connector("jira")).await.unwrap();
        sqlx::query("UPDATE connectors SET config = 'not json'")
            .execute(repo.store.pool())
            .await
            .unwrap();

        // Corrupt JSON must not abort the read.
        let loaded = repo.get_by_name("jira").await.unwrap().unwrap();
        assert!(loaded.config.is_null());
    }
}
