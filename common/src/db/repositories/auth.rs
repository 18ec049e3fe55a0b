// Credential repository.

use super::{decode_json_or_default, empty_to_null, parse_uuid};
use crate::db::Store;
use crate::errors::StoreError;
use crate::models::{AuthCredential, AuthType};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const COLUMNS: &str = "id, name, auth_type, site_domain, service_type, base_url, user_agent, \
                       cookies, tokens, data, created_at, updated_at";

/// Service terms that mark a credential name as API-key-like for the
/// fallback lookup.
const API_KEY_TERMS: &[&str] = &["key", "openai", "anthropic", "google", "github", "slack"];

/// Repository for credential rows.
pub struct AuthRepository {
    store: Store,
    write_lock: Mutex<()>,
}

impl AuthRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Upsert a credential.
    ///
    /// Rows with a site domain conflict on it; API-key style rows with an
    /// empty domain conflict on `(name, auth_type)`.
    #[instrument(skip(self, credential), fields(name = %credential.name))]
    pub async fn save(&self, credential: &AuthCredential) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let tokens = serde_json::to_string(&credential.tokens).unwrap_or_else(|_| "{}".to_string());
        let data = serde_json::to_string(&credential.data).unwrap_or_else(|_| "{}".to_string());
        let conflict_target = if credential.site_domain.trim().is_empty() {
            "name, auth_type"
        } else {
            "site_domain"
        };

        let sql = format!(
            "INSERT INTO auth_credentials ({COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT ({conflict_target}) DO UPDATE SET
                 name = excluded.name,
                 auth_type = excluded.auth_type,
                 site_domain = excluded.site_domain,
                 service_type = excluded.service_type,
                 base_url = excluded.base_url,
                 user_agent = excluded.user_agent,
                 cookies = excluded.cookies,
                 tokens = excluded.tokens,
                 data = excluded.data,
                 updated_at = excluded.updated_at"
        );

        sqlx::query(&sql)
            .bind(credential.id.to_string())
            .bind(&credential.name)
            .bind(credential.auth_type.to_string())
            .bind(empty_to_null(&credential.site_domain))
            .bind(&credential.service_type)
            .bind(&credential.base_url)
            .bind(&credential.user_agent)
            .bind(&credential.cookies)
            .bind(tokens)
            .bind(data)
            .bind(credential.created_at)
            .bind(Utc::now())
            .execute(self.store.pool())
            .await?;

        info!(name = %credential.name, auth_type = %credential.auth_type, "Credential saved");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<AuthCredential>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM auth_credentials WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.store.pool())
        .await?;

        row.map(|r| map_credential(&r)).transpose()
    }

    #[instrument(skip(self))]
    pub async fn get_by_site_domain(
        &self,
        site_domain: &str,
    ) -> Result<Option<AuthCredential>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM auth_credentials WHERE site_domain = ?"
        ))
        .bind(site_domain)
        .fetch_optional(self.store.pool())
        .await?;

        row.map(|r| map_credential(&r)).transpose()
    }

    /// Retrieve by name: exact match first, then a case-insensitive retry
    /// constrained to `auth_type = 'api_key'` when the name looks
    /// API-key-like.
    #[instrument(skip(self))]
    pub async fn get_by_name(&self, name: &str) -> Result<Option<AuthCredential>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM auth_credentials WHERE name = ? ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(self.store.pool())
        .await?;

        if let Some(r) = row {
            return Ok(Some(map_credential(&r)?));
        }

        if !looks_like_api_key(name) {
            return Ok(None);
        }

        debug!(name = name, "Exact credential match missed; trying api_key lookup");
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM auth_credentials
             WHERE LOWER(name) = LOWER(?) AND auth_type = 'api_key'
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(self.store.pool())
        .await?;

        row.map(|r| map_credential(&r)).transpose()
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<AuthCredential>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM auth_credentials ORDER BY created_at DESC"
        ))
        .fetch_all(self.store.pool())
        .await?;

        rows.iter().map(map_credential).collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM auth_credentials WHERE id = ?")
            .bind(id.to_string())
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Credential not found: {}", id)));
        }

        info!(credential_id = %id, "Credential deleted");
        Ok(())
    }
}

fn looks_like_api_key(name: &str) -> bool {
    let lowered = name.to_lowercase();
    API_KEY_TERMS.iter().any(|term| lowered.contains(term))
}

fn map_credential(row: &SqliteRow) -> Result<AuthCredential, StoreError> {
    let id: String = row.try_get("id")?;
    let auth_type: String = row.try_get("auth_type")?;
    let site_domain: Option<String> = row.try_get("site_domain")?;
    let tokens: String = row.try_get("tokens")?;
    let data: String = row.try_get("data")?;

    Ok(AuthCredential {
        id: parse_uuid(&id, "auth_credentials.id")?,
        name: row.try_get("name")?,
        auth_type: AuthType::from_str(&auth_type).unwrap_or_default(),
        site_domain: site_domain.unwrap_or_default(),
        service_type: row.try_get("service_type")?,
        base_url: row.try_get("base_url")?,
        user_agent: row.try_get("user_agent")?,
        cookies: row.try_get("cookies")?,
        tokens: decode_json_or_default::<HashMap<String, String>>(&tokens, "auth_credentials.tokens"),
        data: decode_json_or_default(&data, "auth_credentials.data"),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
