// Connector seeder.
//
// File shape: one section per connector, the section name is the connector
// name; `type` selects the schema of the remaining keys.
//
//   [team-jira]
//   type = "jira"
//   base_url = "https://issues.example.com"

use super::{file_label, read_seed_file, seed_files, DuplicateTracker, SeedSummary};
use crate::db::repositories::connector::ConnectorRepository;
use crate::errors::SeedError;
use crate::models::{normalize_key, Connector, ConnectorType};
use chrono::Utc;
use std::path::Path;
use std::str::FromStr;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Load every connector file in `dir`.
#[instrument(skip(repo))]
pub async fn load_connectors(
    repo: &ConnectorRepository,
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
                warn!(file = %label, error = %e, "Unparseable connector file; skipping");
                summary.skipped += 1;
                continue;
            }
        };

        for (name, body) in table {
            let mut section = match body {
                toml::Value::Table(t) => t,
                _ => {
                    warn!(file = %label, section = %name, "Connector section is not a table; skipping");
                    summary.skipped += 1;
                    continue;
                }
            };

            let kind = match section.remove("type").and_then(|v| v.as_str().map(String::from)) {
                Some(kind) => kind,
                None => {
                    warn!(file = %label, section = %name, "Connector missing type; skipping");
                    summary.skipped += 1;
                    continue;
                }
            };

            let connector_type = match ConnectorType::from_str(&kind) {
                Ok(t) => t,
                Err(reason) => {
                    warn!(file = %label, section = %name, reason = %reason, "Skipping connector");
                    summary.skipped += 1;
                    continue;
                }
            };

            let missing: Vec<&str> = connector_type
                .required_config_keys()
                .iter()
                .filter(|key| !section.contains_key(**key))
                .copied()
                .collect();
            if !missing.is_empty() {
                warn!(
                    file = %label,
                    section = %name,
                    missing = ?missing,
                    "Connector config missing required keys; skipping"
                );
                summary.skipped += 1;
                continue;
            }

            let config = match serde_json::to_value(&section) {
                Ok(config) => config,
                Err(e) => {
                    warn!(file = %label, section = %name, error = %e, "Connector config not representable; skipping");
                    summary.skipped += 1;
                    continue;
                }
            };

            if tracker.check(&normalize_key(&name), &name, &label) {
                summary.duplicates += 1;
            }

            let now = Utc::now();
            let connector = Connector {
                id: Uuid::new_v4(),
                name: name.clone(),
                connector_type,
                config,
                created_at: now,
                updated_at: now,
            };

            match repo.upsert(&connector).await {
                Ok(()) => summary.loaded += 1,
                Err(e) => {
                    warn!(file = %label, section = %name, error = %e, "Failed to store connector; skipping");
                    summary.skipped += 1;
                }
            }
        }
    }

    summary.log("connectors");
    Ok(summary)
}
