// Cookie/token credential seeder.
//
// File shape: one section per credential, the section name is the
// credential name unless the body overrides it.
//
//   [wiki]
//   site_domain = "wiki.example.com"
//   cookies = "session=..."
//   [wiki.tokens]
//   csrf = "..."
//
// Sections carrying an `api_key` field do not belong here and are skipped
// loudly: API keys go in the variables directory.

use super::{file_label, read_seed_file, seed_files, DuplicateTracker, SeedSummary};
use crate::db::repositories::auth::AuthRepository;
use crate::errors::SeedError;
use crate::models::{normalize_key, AuthCredential, AuthType};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{instrument, warn};

#[derive(Debug, Deserialize)]
struct CredentialSection {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    auth_type: Option<String>,
    #[serde(default)]
    site_domain: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    service_type: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    cookies: Option<String>,
    #[serde(default)]
    tokens: Option<HashMap<String, String>>,
    #[serde(default)]
    data: Option<toml::Table>,
    #[serde(default)]
    api_key: Option<String>,
}

/// Load every credential file in `dir` into the auth store.
#[instrument(skip(repo))]
pub async fn load_credentials(
    repo: &AuthRepository,
    dir: &Path,
) -> Result<SeedSummary, SeedError> {
    let mut summary = SeedSummary::default();
    let mut tracker = DuplicateTracker::default();

    for path in seed_files(dir, &["toml"])? {
        let label = file_label(&path);
        let text = read_seed_file(&path)?;

        let table: toml::Table = match toml::from_str(&text) {
            Ok(table) => table,
            Err(e) => {
                warn!(file = %label, error = %e, "Unparseable credential file; skipping");
                summary.skipped += 1;
                continue;
            }
        };

        for (section_name, body) in table {
            let section: CredentialSection = match body.try_into() {
                Ok(section) => section,
                Err(e) => {
                    warn!(file = %label, section = %section_name, error = %e, "Invalid credential section; skipping");
                    summary.skipped += 1;
                    continue;
                }
            };

            if section.api_key.is_some() {
                warn!(
                    file = %label,
                    section = %section_name,
                    "Section declares api_key: API keys belong in the variables directory; skipping"
                );
                summary.skipped += 1;
                continue;
            }

            let name = section
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| section_name.clone());

            let mut credential = AuthCredential::new(name);
            credential.auth_type = section
                .auth_type
                .as_deref()
                .map(|raw| AuthType::from_str(raw).unwrap_or_default())
                .unwrap_or_default();
            credential.site_domain = section.site_domain.unwrap_or_default();
            credential.base_url = section.base_url.unwrap_or_default();
            credential.service_type = section.service_type.unwrap_or_default();
            credential.user_agent = section.user_agent.unwrap_or_default();
            credential.cookies = section.cookies.unwrap_or_default();
            credential.tokens = section.tokens.unwrap_or_default();
            if let Some(data) = section.data {
                match serde_json::to_value(&data) {
                    Ok(serde_json::Value::Object(map)) => {
                        credential.data = map.into_iter().collect();
                    }
                    _ => {
                        warn!(file = %label, section = %section_name, "Credential data table not representable; dropping");
                    }
                }
            }

            if let Err(reason) = credential.derive_endpoints() {
                warn!(file = %label, section = %section_name, reason = %reason, "Invalid credential; skipping");
                summary.skipped += 1;
                continue;
            }

            if tracker.check(&normalize_key(&credential.name), &credential.name, &label) {
                summary.duplicates += 1;
            }

            match repo.save(&credential).await {
                Ok(()) => summary.loaded += 1,
                Err(e) => {
                    warn!(file = %label, section = %section_name, error = %e, "Failed to store credential; skipping");
                    summary.skipped += 1;
                }
            }
        }
    }

    summary.log("credentials");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use std::fs;
    use tempfile::TempDir;

    async fn repo() -> AuthRepository {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        AuthRepository::new(store)
    }

    #[tokio::test]
    async fn test_load_cookie_credential() {
        let repo = repo().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("wiki.toml"),
            r#"
[wiki]
site_domain = "wiki.example.com"
cookies = "session=abc"
service_type = "confluence"

[wiki.tokens]
csrf = "token-1"
"#,
        )
        .unwrap();

        let summary = load_credentials(&repo, dir.path()).await.unwrap();
        assert_eq!(summary.loaded, 1);

        let cred = repo.get_by_name("wiki").await.unwrap().unwrap();
        assert_eq!(cred.site_domain, "wiki.example.com");
        assert_eq!(cred.base_url, "https://wiki.example.com");
        assert_eq!(cred.cookies, "session=abc");
        assert_eq!(cred.tokens.get("csrf").unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_api_key_sections_are_rejected() {
        let repo = repo().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("keys.toml"),
            r#"
[openai]
api_key = "sk-secret"
base_url = "https://api.openai.example"
"#,
        )
        .unwrap();

        let summary = load_credentials(&repo, dir.path()).await.unwrap();
        assert_eq!(summary.loaded, 0);
        assert_eq!(summary.skipped, 1);
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_domain_and_url_skipped() {
        let repo = repo().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("bad.toml"),
            "[nameless]\ncookies = \"session=1\"\n",
        )
        .unwrap();

        let summary = load_credentials(&repo, dir.path()).await.unwrap();
        assert_eq!(summary.loaded, 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_reseed_is_idempotent() {
        let repo = repo().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("wiki.toml"),
            "[wiki]\nsite_domain = \"wiki.example.com\"\n",
        )
        .unwrap();

        load_credentials(&repo, dir.path()).await.unwrap();
        load_credentials(&repo, dir.path()).await.unwrap();
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
