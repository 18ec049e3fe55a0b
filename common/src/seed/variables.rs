// Key/value variable seeder.
//
// File shape: one section per variable, the section name is the key.
//
//   [api-token]
//   value = "tok-xyz"
//   description = "service token for the wiki crawler"

use super::{file_label, read_seed_file, seed_files, DuplicateTracker, SeedSummary};
use crate::db::repositories::kv::KeyValueRepository;
use crate::errors::SeedError;
use crate::models::{normalize_key, KeyValueEntry};
use serde::Deserialize;
use std::path::Path;
use tracing::{instrument, warn};

#[derive(Debug, Deserialize)]
struct VariableSection {
    value: String,
    #[serde(default)]
    description: Option<String>,
}

/// Load every variable file in `dir` into the kv store.
#[instrument(skip(repo))]
pub async fn load_variables(
    repo: &KeyValueRepository,
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
                warn!(file = %label, error = %e, "Unparseable variable file; skipping");
                summary.skipped += 1;
                continue;
            }
        };

        for (key, body) in table {
            let section: VariableSection = match body.try_into() {
                Ok(section) => section,
                Err(e) => {
                    warn!(file = %label, key = %key, error = %e, "Invalid variable section; skipping");
                    summary.skipped += 1;
                    continue;
                }
            };

            if section.value.trim().is_empty() {
                warn!(file = %label, key = %key, "Variable has empty value; skipping");
                summary.skipped += 1;
                continue;
            }

            if tracker.check(&normalize_key(&key), &key, &label) {
                summary.duplicates += 1;
            }

            let mut entry = KeyValueEntry::new(key.clone(), section.value);
            entry.description = section.description;

            match repo.upsert(&entry).await {
                Ok(()) => summary.loaded += 1,
                Err(e) => {
                    warn!(file = %label, key = %key, error = %e, "Failed to store variable; skipping");
                    summary.skipped += 1;
                }
            }
        }
    }

    summary.log("variables");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use std::fs;
    use tempfile::TempDir;

    async fn repo() -> KeyValueRepository {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        KeyValueRepository::new(store)
    }

    #[tokio::test]
    async fn test_load_variables() {
        let repo = repo().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("tokens.toml"),
            r#"
[api-token]
value = "tok-xyz"

[Base-Host]
value = "wiki.example.com"
description = "crawl target"
"#,
        )
        .unwrap();

        let summary = load_variables(&repo, dir.path()).await.unwrap();
        assert_eq!(summary.loaded, 2);
        assert_eq!(summary.skipped, 0);

        assert_eq!(repo.get("api-token").await.unwrap().unwrap().value, "tok-xyz");
        let host = repo.get("base-host").await.unwrap().unwrap();
        assert_eq!(host.key, "Base-Host");
        assert_eq!(host.description.as_deref(), Some("crawl target"));
    }

    #[tokio::test]
    async fn test_later_file_overrides_with_duplicate_warning() {
        let repo = repo().await;
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.toml"), "[google-api-key]\nvalue = \"first\"\n").unwrap();
        fs::write(dir.path().join("b.toml"), "[Google-API-Key]\nvalue = \"second\"\n").unwrap();

        let summary = load_variables(&repo, dir.path()).await.unwrap();
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.loaded, 2);

        assert_eq!(
            repo.get("google-api-key").await.unwrap().unwrap().value,
            "second"
        );
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_sections_skip_but_pass_continues() {
        let repo = repo().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("mixed.toml"),
            r#"
[empty]
value = ""

[good]
value = "kept"

[malformed]
description = "no value key"
"#,
        )
        .unwrap();

        let summary = load_variables(&repo, dir.path()).await.unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.skipped, 2);
        assert!(repo.get("good").await.unwrap().is_some());
        assert!(repo.get("empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotent_reseed() {
        let repo = repo().await;
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("t.toml"), "[k]\nvalue = \"v\"\n").unwrap();

        load_variables(&repo, dir.path()).await.unwrap();
        let first = repo.list().await.unwrap();
        load_variables(&repo, dir.path()).await.unwrap();
        let second = repo.list().await.unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].value, second[0].value);
        assert_eq!(first[0].created_at, second[0].created_at);
    }
}
