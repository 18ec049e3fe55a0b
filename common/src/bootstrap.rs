// Startup wiring shared by the daemon and the integration tests.
//
// Order matters: open store → migrations → default system definitions →
// file seeders (variables before definitions, because definition loading
// resolves placeholders and credential references) → orphan recovery.
// Store, migration, or default-seeding failures abort startup; seed
// directory problems degrade to warnings.

use crate::config::Settings;
use crate::db::repositories::auth::AuthRepository;
use crate::db::repositories::connector::ConnectorRepository;
use crate::db::repositories::document::DocumentRepository;
use crate::db::repositories::job::JobRepository;
use crate::db::repositories::job_definition::JobDefinitionRepository;
use crate::db::repositories::job_log::JobLogRepository;
use crate::db::repositories::kv::KeyValueRepository;
use crate::db::repositories::seen_url::SeenUrlRepository;
use crate::db::Store;
use crate::executor::{ActionRegistry, JobRunner};
use crate::reaper::StaleJobReaper;
use crate::scheduler::engine::SchedulerConfig;
use crate::scheduler::Scheduler;
use crate::seed;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The wired engine: every repository plus the scheduler and reaper, all
/// sharing one store handle and one shutdown token.
pub struct Engine {
    pub store: Store,
    pub auth: Arc<AuthRepository>,
    pub kv: Arc<KeyValueRepository>,
    pub connectors: Arc<ConnectorRepository>,
    pub documents: Arc<DocumentRepository>,
    pub jobs: Arc<JobRepository>,
    pub job_logs: Arc<JobLogRepository>,
    pub definitions: Arc<JobDefinitionRepository>,
    pub seen_urls: Arc<SeenUrlRepository>,
    pub runner: Arc<JobRunner>,
    pub scheduler: Arc<Scheduler>,
    pub reaper: Arc<StaleJobReaper>,
    pub shutdown: CancellationToken,
}

/// Open the store, migrate, seed, recover, and wire the engine.
pub async fn init_engine(settings: &Settings) -> Result<Engine> {
    let store = Store::open(&settings.database, &settings.environment)
        .await
        .context("Failed to open store")?;

    store.migrate().await.context("Failed to apply migrations")?;

    let auth = Arc::new(AuthRepository::new(store.clone()));
    let kv = Arc::new(KeyValueRepository::new(store.clone()));
    let connectors = Arc::new(ConnectorRepository::new(store.clone()));
    let documents = Arc::new(DocumentRepository::new(store.clone()));
    let jobs = Arc::new(JobRepository::new(store.clone()));
    let job_logs = Arc::new(JobLogRepository::new(store.clone()));
    let definitions = Arc::new(JobDefinitionRepository::new(store.clone()));
    let seen_urls = Arc::new(SeenUrlRepository::new(store.clone()));

    seed::defaults::seed_system_definitions(&definitions)
        .await
        .context("Failed to seed default system definitions")?;

    load_seed_directories(settings, &kv, &auth, &connectors, &definitions).await;

    // Runs left `running` by a crash resume as pending on this startup.
    let recovered = jobs
        .mark_running_as_pending("startup recovery")
        .await
        .context("Failed to recover orphaned runs")?;
    if recovered > 0 {
        info!(count = recovered, "Recovered orphaned runs");
    }

    let shutdown = CancellationToken::new();
    let registry = Arc::new(ActionRegistry::with_builtins());
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        Arc::clone(&jobs),
        Arc::clone(&definitions),
        Arc::clone(&documents),
        Arc::clone(&seen_urls),
        Arc::clone(&job_logs),
        registry,
        settings.executor.clone(),
        settings.crawler.clone(),
        shutdown.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::from(&settings.scheduler),
        Arc::clone(&definitions),
        Arc::clone(&auth),
        Arc::clone(&jobs),
        Arc::clone(&runner),
        shutdown.clone(),
    ));

    let reaper = Arc::new(StaleJobReaper::new(
        Arc::clone(&jobs),
        Arc::clone(&job_logs),
        settings.reaper.clone(),
    ));

    info!("Engine initialized");
    Ok(Engine {
        store,
        auth,
        kv,
        connectors,
        documents,
        jobs,
        job_logs,
        definitions,
        seen_urls,
        runner,
        scheduler,
        reaper,
        shutdown,
    })
}

async fn load_seed_directories(
    settings: &Settings,
    kv: &KeyValueRepository,
    auth: &AuthRepository,
    connectors: &ConnectorRepository,
    definitions: &JobDefinitionRepository,
) {
    if let Some(dir) = &settings.seed.variables_dir {
        if let Err(e) = seed::variables::load_variables(kv, Path::new(dir)).await {
            warn!(dir = dir, error = %e, "Variable seeding failed");
        }
    }
    if let Some(dir) = &settings.seed.auth_dir {
        if let Err(e) = seed::credentials::load_credentials(auth, Path::new(dir)).await {
            warn!(dir = dir, error = %e, "Credential seeding failed");
        }
    }
    if let Some(dir) = &settings.seed.connectors_dir {
        if let Err(e) = seed::connectors::load_connectors(connectors, Path::new(dir)).await {
            warn!(dir = dir, error = %e, "Connector seeding failed");
        }
    }
    if let Some(dir) = &settings.seed.jobs_dir {
        if let Err(e) =
            seed::definitions::load_definitions(definitions, auth, kv, Path::new(dir)).await
        {
            warn!(dir = dir, error = %e, "Definition seeding failed");
        }
    }
}
