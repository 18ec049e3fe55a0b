// Job definition seeder.
//
// Accepts `.toml` and `.json` files with the same schema. A file is either
// one definition at the top level (its id taken from the `id` field or the
// file stem) or a set of `[section]` tables, one definition per section
// with the section name as the id.
//
// Before persisting, `{key-name}` placeholders are expanded against the kv
// store across the job config, every step config, `base_url`, `auth_id`,
// and `source_type`. If the kv snapshot cannot be read, substitution is
// skipped with a warning; definitions still load.

use super::{file_label, read_seed_file, seed_files, DuplicateTracker, SeedSummary};
use crate::db::repositories::auth::AuthRepository;
use crate::db::repositories::job_definition::JobDefinitionRepository;
use crate::db::repositories::kv::KeyValueRepository;
use crate::errors::{SeedError, ValidationError};
use crate::models::{
    normalize_key, JobDefinition, JobDefinitionType, JobOwner, JobStep, ErrorTolerance,
};
use crate::resolver::VariableResolver;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{instrument, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct DefinitionSection {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    def_type: JobDefinitionType,
    #[serde(default)]
    job_type: JobOwner,
    #[serde(default)]
    description: String,
    #[serde(default)]
    source_type: String,
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    auth_id: Option<String>,
    #[serde(default)]
    steps: Vec<JobStep>,
    #[serde(default)]
    schedule: String,
    #[serde(default)]
    timeout: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    auto_start: bool,
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    pre_jobs: Vec<String>,
    #[serde(default)]
    post_jobs: Vec<String>,
    #[serde(default)]
    error_tolerance: Option<ErrorTolerance>,
}

fn default_true() -> bool {
    true
}

/// Load every definition file in `dir`.
#[instrument(skip(definitions, auth, kv))]
pub async fn load_definitions(
    definitions: &JobDefinitionRepository,
    auth: &AuthRepository,
    kv: &KeyValueRepository,
    dir: &Path,
) -> Result<SeedSummary, SeedError> {
    let mut summary = SeedSummary::default();
    let mut tracker = DuplicateTracker::default();

    // One kv snapshot for the whole pass; a read failure degrades to
    // unresolved placeholders rather than aborting the load.
    let resolver = match kv.snapshot().await {
        Ok(vars) => Some(VariableResolver::new(vars)),
        Err(e) => {
            warn!(error = %e, "Variable snapshot unavailable; skipping placeholder substitution");
            None
        }
    };

    for path in seed_files(dir, &["toml", "json"])? {
        let label = file_label(&path);
        let text = read_seed_file(&path)?;

        let root = match parse_file(&path, &text) {
            Ok(root) => root,
            Err(reason) => {
                warn!(file = %label, reason = %reason, "Unparseable definition file; skipping");
                summary.skipped += 1;
                continue;
            }
        };

        for (id, section_value) in split_sections(&path, root) {
            let section: DefinitionSection = match serde_json::from_value(section_value) {
                Ok(section) => section,
                Err(e) => {
                    warn!(file = %label, id = %id, error = %e, "Invalid definition section; skipping");
                    summary.skipped += 1;
                    continue;
                }
            };

            let definition = match build_definition(id, section, resolver.as_ref(), auth, &text)
                .await
            {
                Ok(definition) => definition,
                Err(reason) => {
                    warn!(file = %label, reason = %reason, "Invalid definition; skipping");
                    summary.skipped += 1;
                    continue;
                }
            };

            if tracker.check(&normalize_key(&definition.id), &definition.id, &label) {
                summary.duplicates += 1;
            }

            match definitions.save(&definition).await {
                Ok(()) => summary.loaded += 1,
                Err(e) => {
                    warn!(file = %label, id = %definition.id, error = %e, "Failed to store definition; skipping");
                    summary.skipped += 1;
                }
            }
        }
    }

    summary.log("job definitions");
    Ok(summary)
}

fn parse_file(path: &Path, text: &str) -> Result<Value, String> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e == "json")
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(text).map_err(|e| e.to_string())
    } else {
        let table: toml::Table = toml::from_str(text).map_err(|e| e.to_string())?;
        serde_json::to_value(table).map_err(|e| e.to_string())
    }
}

/// A file either is one definition (top-level `steps`) or holds one
/// definition per section.
fn split_sections(path: &Path, root: Value) -> Vec<(String, Value)> {
    let object = match root {
        Value::Object(map) => map,
        _ => return Vec::new(),
    };

    if object.contains_key("steps") {
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
        return vec![(id, Value::Object(object))];
    }

    object
        .into_iter()
        .filter(|(_, v)| v.is_object())
        .collect()
}

async fn build_definition(
    section_id: String,
    section: DefinitionSection,
    resolver: Option<&VariableResolver>,
    auth: &AuthRepository,
    raw_source: &str,
) -> Result<JobDefinition, ValidationError> {
    let id = section
        .id
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(section_id);
    if id.trim().is_empty() {
        return Err(ValidationError::MissingField("id".to_string()));
    }

    let name = section
        .name
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| id.clone());

    let mut config = section.config;
    let mut steps = section.steps;
    let mut base_url = section.base_url;
    let mut source_type = section.source_type;
    let mut auth_ref = section.auth_id.unwrap_or_default();

    if let Some(resolver) = resolver {
        config = resolver.resolve_map(&config);
        for step in &mut steps {
            step.config = resolver.resolve_map(&step.config);
        }
        base_url = resolver.resolve_str(&base_url);
        source_type = resolver.resolve_str(&source_type);
        auth_ref = resolver.resolve_str(&auth_ref);
    }

    if steps.is_empty() {
        return Err(ValidationError::InvalidFieldValue {
            field: "steps".to_string(),
            reason: format!("definition '{}' has no steps", id),
        });
    }
    for step in &steps {
        if step.action.trim().is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "action".to_string(),
                reason: format!("definition '{}' step '{}' has an empty action", id, step.name),
            });
        }
    }
    if !section.schedule.trim().is_empty() {
        crate::schedule::parse_cron_expression(&section.schedule).map_err(|e| {
            ValidationError::InvalidFieldValue {
                field: "schedule".to_string(),
                reason: e.to_string(),
            }
        })?;
    }
    if !section.timeout.trim().is_empty() {
        crate::schedule::parse_duration(&section.timeout).map_err(|e| {
            ValidationError::InvalidFieldValue {
                field: "timeout".to_string(),
                reason: e.to_string(),
            }
        })?;
    }

    let auth_id = resolve_auth_reference(&auth_ref, auth).await;

    let now = Utc::now();
    Ok(JobDefinition {
        id,
        name,
        def_type: section.def_type,
        job_type: section.job_type,
        description: section.description,
        source_type,
        base_url,
        auth_id,
        steps,
        schedule: section.schedule.trim().to_string(),
        timeout: section.timeout.trim().to_string(),
        enabled: section.enabled,
        auto_start: section.auto_start,
        config,
        pre_jobs: section.pre_jobs,
        post_jobs: section.post_jobs,
        error_tolerance: section.error_tolerance,
        raw_source: raw_source.to_string(),
        created_at: now,
        updated_at: now,
    })
}

/// Files reference credentials by UUID or by name; names are resolved so
/// the stored weak FK always points at a real row. An unresolvable
/// reference is dropped with a warning.
async fn resolve_auth_reference(reference: &str, auth: &AuthRepository) -> Option<Uuid> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }

    if let Ok(id) = Uuid::parse_str(reference) {
        return Some(id);
    }

    match auth.get_by_name(reference).await {
        Ok(Some(credential)) => Some(credential.id),
        Ok(None) => {
            warn!(reference = reference, "Credential reference not found; dropping auth_id");
            None
        }
        Err(e) => {
            warn!(reference = reference, error = %e, "Credential lookup failed; dropping auth_id");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::kv::KeyValueRepository;
    use crate::db::Store;
    use crate::models::KeyValueEntry;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        definitions: JobDefinitionRepository,
        auth: AuthRepository,
        kv: KeyValueRepository,
    }

    async fn fixture() -> Fixture {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        Fixture {
            definitions: JobDefinitionRepository::new(store.clone()),
            auth: AuthRepository::new(store.clone()),
            kv: KeyValueRepository::new(store),
        }
    }

    #[tokio::test]
    async fn test_load_sectioned_file_with_substitution() {
        let f = fixture().await;
        f.kv.upsert(&KeyValueEntry::new("api-token", "tok-xyz"))
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("jobs.toml"),
            r#"
[daily-crawl]
name = "daily"
type = "crawler"
schedule = "0 * * * *"
enabled = true
auto_start = true
source_type = "web"

[daily-crawl.config]
token = "{api-token}"
start_urls = ["https://example.test/"]

[[daily-crawl.steps]]
name = "crawl"
action = "crawl"

[daily-crawl.steps.config]
max_depth = 0
concurrency = 2
"#,
        )
        .unwrap();

        let summary = load_definitions(&f.definitions, &f.auth, &f.kv, dir.path())
            .await
            .unwrap();
        assert_eq!(summary.loaded, 1);

        let def = f.definitions.get("daily-crawl").await.unwrap().unwrap();
        assert_eq!(def.name, "daily");
        assert_eq!(def.config["token"], "tok-xyz");
        assert_eq!(def.schedule, "0 * * * *");
        assert!(def.auto_start);
        assert_eq!(def.steps[0].config["concurrency"], 2);
    }

    #[tokio::test]
    async fn test_single_definition_file_uses_stem_id() {
        let f = fixture().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("nightly-sync.toml"),
            r#"
name = "nightly"
type = "custom"

[[steps]]
name = "work"
action = "database_maintenance"
"#,
        )
        .unwrap();

        load_definitions(&f.definitions, &f.auth, &f.kv, dir.path())
            .await
            .unwrap();
        assert!(f.definitions.get("nightly-sync").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_json_file_same_schema() {
        let f = fixture().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("jobs.json"),
            r#"{
  "weekly-report": {
    "name": "weekly",
    "type": "summarizer",
    "schedule": "0 6 * * 1",
    "steps": [{ "name": "summarize", "action": "corpus_summary" }]
  }
}"#,
        )
        .unwrap();

        let summary = load_definitions(&f.definitions, &f.auth, &f.kv, dir.path())
            .await
            .unwrap();
        assert_eq!(summary.loaded, 1);
        let def = f.definitions.get("weekly-report").await.unwrap().unwrap();
        assert_eq!(def.def_type, JobDefinitionType::Summarizer);
    }

    #[tokio::test]
    async fn test_invalid_sections_skipped() {
        let f = fixture().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("jobs.toml"),
            r#"
[no-steps]
name = "empty"

[bad-cron]
schedule = "whenever"
[[bad-cron.steps]]
name = "s"
action = "crawl"

[good]
[[good.steps]]
name = "s"
action = "crawl"
"#,
        )
        .unwrap();

        let summary = load_definitions(&f.definitions, &f.auth, &f.kv, dir.path())
            .await
            .unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.skipped, 2);
        assert!(f.definitions.get("good").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_auth_reference_by_name() {
        let f = fixture().await;
        let mut cred = crate::models::AuthCredential::new("wiki");
        cred.site_domain = "wiki.example.com".to_string();
        cred.derive_endpoints().unwrap();
        f.auth.save(&cred).await.unwrap();

        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("jobs.toml"),
            r#"
[wiki-crawl]
auth_id = "wiki"
[[wiki-crawl.steps]]
name = "s"
action = "crawl"
"#,
        )
        .unwrap();

        load_definitions(&f.definitions, &f.auth, &f.kv, dir.path())
            .await
            .unwrap();
        let def = f.definitions.get("wiki-crawl").await.unwrap().unwrap();
        assert_eq!(def.auth_id, Some(cred.id));
    }

    #[tokio::test]
    async fn test_unknown_placeholder_left_intact() {
        let f = fixture().await;
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("jobs.toml"),
            r#"
[d]
[d.config]
token = "{never-seeded}"
[[d.steps]]
name = "s"
action = "crawl"
"#,
        )
        .unwrap();

        load_definitions(&f.definitions, &f.auth, &f.kv, dir.path())
            .await
            .unwrap();
        let def = f.definitions.get("d").await.unwrap().unwrap();
        assert_eq!(def.config["token"], "{never-seeded}");
    }
}
