// Default system definitions, upserted at startup with DO NOTHING so user
// edits survive restarts. A failure here aborts startup.

use crate::db::repositories::job_definition::JobDefinitionRepository;
use crate::errors::StoreError;
use crate::models::{
    JobDefinition, JobDefinitionType, JobOwner, JobStep, StepErrorPolicy,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{info, instrument};

pub const MAINTENANCE_DEFINITION_ID: &str = "system-database-maintenance";
pub const CORPUS_SUMMARY_DEFINITION_ID: &str = "system-corpus-summary";

/// Seed the built-in system definitions.
#[instrument(skip(repo))]
pub async fn seed_system_definitions(repo: &JobDefinitionRepository) -> Result<(), StoreError> {
    for definition in [maintenance_definition(), corpus_summary_definition()] {
        repo.save_if_absent(&definition).await?;
    }
    info!("System definitions seeded");
    Ok(())
}

fn maintenance_definition() -> JobDefinition {
    let mut step_config = Map::new();
    step_config.insert("retention_days".to_string(), json!(30));

    system_definition(
        MAINTENANCE_DEFINITION_ID,
        "Database Maintenance",
        JobDefinitionType::Maintenance,
        "Prunes old terminal runs and refreshes query statistics.",
        // Nightly, off-peak.
        "0 3 * * *",
        JobStep {
            name: "maintenance".to_string(),
            action: "database_maintenance".to_string(),
            config: step_config,
            on_error: StepErrorPolicy::Fail,
        },
    )
}

fn corpus_summary_definition() -> JobDefinition {
    system_definition(
        CORPUS_SUMMARY_DEFINITION_ID,
        "Corpus Summary",
        JobDefinitionType::Summarizer,
        "Writes a per-source document census into the corpus.",
        "30 5 * * *",
        JobStep {
            name: "summarize".to_string(),
            action: "corpus_summary".to_string(),
            config: Map::new(),
            on_error: StepErrorPolicy::Fail,
        },
    )
}

fn system_definition(
    id: &str,
    name: &str,
    def_type: JobDefinitionType,
    description: &str,
    schedule: &str,
    step: JobStep,
) -> JobDefinition {
    let now = Utc::now();
    JobDefinition {
        id: id.to_string(),
        name: name.to_string(),
        def_type,
        job_type: JobOwner::System,
        description: description.to_string(),
        source_type: String::new(),
        base_url: String::new(),
        auth_id: None,
        steps: vec![step],
        schedule: schedule.to_string(),
        timeout: "1h".to_string(),
        enabled: true,
        auto_start: false,
        config: Map::<String, Value>::new(),
        pre_jobs: vec![],
        post_jobs: vec![],
        error_tolerance: None,
        raw_source: String::new(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    #[tokio::test]
    async fn test_defaults_seeded_once() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let repo = JobDefinitionRepository::new(store);

        seed_system_definitions(&repo).await.unwrap();

        let maintenance = repo.get(MAINTENANCE_DEFINITION_ID).await.unwrap().unwrap();
        assert_eq!(maintenance.job_type, JobOwner::System);
        assert_eq!(maintenance.steps[0].action, "database_maintenance");

        let summary = repo.get(CORPUS_SUMMARY_DEFINITION_ID).await.unwrap().unwrap();
        assert_eq!(summary.steps[0].action, "corpus_summary");
    }

    #[tokio::test]
    async fn test_user_edits_survive_reseed() {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let repo = JobDefinitionRepository::new(store);

        seed_system_definitions(&repo).await.unwrap();

        let mut edited = repo.get(MAINTENANCE_DEFINITION_ID).await.unwrap().unwrap();
        edited.schedule = "0 4 * * *".to_string();
        repo.save(&edited).await.unwrap();

        seed_system_definitions(&repo).await.unwrap();
        let after = repo.get(MAINTENANCE_DEFINITION_ID).await.unwrap().unwrap();
        assert_eq!(after.schedule, "0 4 * * *");
    }
}
