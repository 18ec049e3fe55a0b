// Job definition registry.

use super::{decode_json_or_default, parse_uuid};
use crate::db::Store;
use crate::errors::StoreError;
use crate::models::{ErrorTolerance, JobDefinition, JobDefinitionType, JobOwner, JobStep};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{info, instrument};

const COLUMNS: &str = "id, name, type, job_type, description, source_type, base_url, auth_id, \
                       steps, schedule, timeout, enabled, auto_start, config, pre_jobs, \
                       post_jobs, error_tolerance, raw_source, created_at, updated_at";

/// Whitelisted ordering for `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Name,
}

impl OrderField {
    fn column(&self) -> &'static str {
        match self {
            OrderField::CreatedAt => "created_at",
            OrderField::UpdatedAt => "updated_at",
            OrderField::Name => "name",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    Asc,
    #[default]
    Desc,
}

impl OrderDirection {
    fn keyword(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

/// Pagination and ordering for definition listings. Defaults to
/// `created_at DESC`, no offset, a generous limit.
#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub order_by: OrderField,
    pub direction: OrderDirection,
    pub offset: i64,
    pub limit: i64,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            order_by: OrderField::CreatedAt,
            direction: OrderDirection::Desc,
            offset: 0,
            limit: 500,
        }
    }
}

/// Repository for workflow templates.
pub struct JobDefinitionRepository {
    store: Store,
    write_lock: Mutex<()>,
}

impl JobDefinitionRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Upsert by id: an on-disk file or API write overrides the stored row.
    #[instrument(skip(self, definition), fields(definition_id = %definition.id))]
    pub async fn save(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        self.save_inner(definition, true).await
    }

    /// Insert only if absent (DO NOTHING): used for default system
    /// definitions so user edits survive restarts.
    #[instrument(skip(self, definition), fields(definition_id = %definition.id))]
    pub async fn save_if_absent(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        self.save_inner(definition, false).await
    }

    async fn save_inner(
        &self,
        definition: &JobDefinition,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let steps = serde_json::to_string(&definition.steps).unwrap_or_else(|_| "[]".to_string());
        let config = serde_json::to_string(&definition.config).unwrap_or_else(|_| "{}".to_string());
        let pre_jobs =
            serde_json::to_string(&definition.pre_jobs).unwrap_or_else(|_| "[]".to_string());
        let post_jobs =
            serde_json::to_string(&definition.post_jobs).unwrap_or_else(|_| "[]".to_string());
        let error_tolerance = definition
            .error_tolerance
            .as_ref()
            .map(|t| serde_json::to_string(t).unwrap_or_else(|_| "null".to_string()));

        let conflict_clause = if overwrite {
            "ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 type = excluded.type,
                 job_type = excluded.job_type,
                 description = excluded.description,
                 source_type = excluded.source_type,
                 base_url = excluded.base_url,
                 auth_id = excluded.auth_id,
                 steps = excluded.steps,
                 schedule = excluded.schedule,
                 timeout = excluded.timeout,
                 enabled = excluded.enabled,
                 auto_start = excluded.auto_start,
                 config = excluded.config,
                 pre_jobs = excluded.pre_jobs,
                 post_jobs = excluded.post_jobs,
                 error_tolerance = excluded.error_tolerance,
                 raw_source = excluded.raw_source,
                 updated_at = excluded.updated_at"
        } else {
            "ON CONFLICT (id) DO NOTHING"
        };

        let sql = format!(
            "INSERT INTO job_definitions ({COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             {conflict_clause}"
        );

        sqlx::query(&sql)
            .bind(&definition.id)
            .bind(&definition.name)
            .bind(definition.def_type.to_string())
            .bind(definition.job_type.to_string())
            .bind(&definition.description)
            .bind(&definition.source_type)
            .bind(&definition.base_url)
            .bind(definition.auth_id.map(|id| id.to_string()))
            .bind(steps)
            .bind(&definition.schedule)
            .bind(&definition.timeout)
            .bind(definition.enabled)
            .bind(definition.auto_start)
            .bind(config)
            .bind(pre_jobs)
            .bind(post_jobs)
            .bind(error_tolerance)
            .bind(&definition.raw_source)
            .bind(definition.created_at)
            .bind(Utc::now())
            .execute(self.store.pool())
            .await?;

        info!(definition_id = %definition.id, "Job definition saved");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<JobDefinition>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_definitions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;

        row.map(map_definition).transpose()
    }

    #[instrument(skip(self))]
    pub async fn list(&self, options: ListOptions) -> Result<Vec<JobDefinition>, StoreError> {
        // Order column and direction come from closed enums, never from the
        // caller's raw input.
        let sql = format!(
            "SELECT {COLUMNS} FROM job_definitions ORDER BY {} {} LIMIT ? OFFSET ?",
            options.order_by.column(),
            options.direction.keyword()
        );

        let rows = sqlx::query(&sql)
            .bind(options.limit)
            .bind(options.offset)
            .fetch_all(self.store.pool())
            .await?;

        rows.into_iter().map(map_definition).collect()
    }

    #[instrument(skip(self))]
    pub async fn list_by_type(
        &self,
        def_type: JobDefinitionType,
    ) -> Result<Vec<JobDefinition>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_definitions WHERE type = ? ORDER BY created_at DESC"
        ))
        .bind(def_type.to_string())
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter().map(map_definition).collect()
    }

    #[instrument(skip(self))]
    pub async fn list_enabled(&self) -> Result<Vec<JobDefinition>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_definitions WHERE enabled = 1 ORDER BY created_at DESC"
        ))
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter().map(map_definition).collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM job_definitions WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Definition not found: {}", id)));
        }

        info!(definition_id = %id, "Job definition deleted");
        Ok(())
    }
}

fn map_definition(row: SqliteRow) -> Result<JobDefinition, StoreError> {
    let def_type: String = row.try_get("type")?;
    let job_type: String = row.try_get("job_type")?;
    let auth_id: Option<String> = row.try_get("auth_id")?;
    let steps: String = row.try_get("steps")?;
    let config: String = row.try_get("config")?;
    let pre_jobs: String = row.try_get("pre_jobs")?;
    let post_jobs: String = row.try_get("post_jobs")?;
    let error_tolerance: Option<String> = row.try_get("error_tolerance")?;

    let auth_id = auth_id
        .map(|raw| parse_uuid(&raw, "job_definitions.auth_id"))
        .transpose()?;

    let error_tolerance: Option<ErrorTolerance> = error_tolerance
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());

    Ok(JobDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        def_type: JobDefinitionType::from_str(&def_type).unwrap_or_default(),
        job_type: JobOwner::from_str(&job_type).unwrap_or_default(),
        description: row.try_get("description")?,
        source_type: row.try_get("source_type")?,
        base_url: row.try_get("base_url")?,
        auth_id,
        steps: decode_json_or_default::<Vec<JobStep>>(&steps, "job_definitions.steps"),
        schedule: row.try_get("schedule")?,
        timeout: row.try_get("timeout")?,
        enabled: row.try_get("enabled")?,
        auto_start: row.try_get("auto_start")?,
        config: decode_json_or_default(&config, "job_definitions.config"),
        pre_jobs: decode_json_or_default(&pre_jobs, "job_definitions.pre_jobs"),
        post_jobs: decode_json_or_default(&post_jobs, "job_definitions.post_jobs"),
        error_tolerance,
        raw_source: row.try_get("raw_source")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepErrorPolicy;
    use serde_json::Map;

    async fn repo() -> JobDefinitionRepository {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        JobDefinitionRepository::new(store)
    }

    fn definition(id: &str, name: &str) -> JobDefinition {
        JobDefinition {
            id: id.to_string(),
            name: name.to_string(),
            def_type: JobDefinitionType::Crawler,
            job_type: JobOwner::User,
            description: "desc".to_string(),
            source_type: "web".to_string(),
            base_url: String::new(),
            auth_id: None,
            steps: vec![JobStep {
                name: "crawl".to_string(),
                action: "crawl".to_string(),
                config: Map::new(),
                on_error: StepErrorPolicy::Continue,
            }],
            schedule: "0 * * * *".to_string(),
            timeout: "30m".to_string(),
            enabled: true,
            auto_start: false,
            config: Map::new(),
            pre_jobs: vec!["warmup".to_string()],
            post_jobs: vec![],
            error_tolerance: Some(ErrorTolerance {
                max_failure_ratio: 0.5,
            }),
            raw_source: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_get_round_trip() {
        let repo = repo().await;
        let def = definition("daily-crawl", "daily");
        repo.save(&def).await.unwrap();

        let loaded = repo.get("daily-crawl").await.unwrap().unwrap();
        assert_eq!(loaded.name, "daily");
        assert_eq!(loaded.def_type, JobDefinitionType::Crawler);
        assert_eq!(loaded.job_type, JobOwner::User);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].on_error, StepErrorPolicy::Continue);
        assert_eq!(loaded.schedule, "0 * * * *");
        assert_eq!(loaded.pre_jobs, vec!["warmup"]);
        assert_eq!(
            loaded.error_tolerance,
            Some(ErrorTolerance {
                max_failure_ratio: 0.5
            })
        );
    }

    #[tokio::test]
    async fn test_save_overwrites_existing() {
        let repo = repo().await;
        repo.save(&definition("d", "first")).await.unwrap();
        repo.save(&definition("d", "second")).await.unwrap();

        let loaded = repo.get("d").await.unwrap().unwrap();
        assert_eq!(loaded.name, "second");
        assert_eq!(repo.list(ListOptions::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_if_absent_preserves_user_edits() {
        let repo = repo().await;
        repo.save(&definition("sys", "user-customized")).await.unwrap();
        repo.save_if_absent(&definition("sys", "factory-default"))
            .await
            .unwrap();

        let loaded = repo.get("sys").await.unwrap().unwrap();
        assert_eq!(loaded.name, "user-customized");
    }

    #[tokio::test]
    async fn test_list_ordering_by_name() {
        let repo = repo().await;
        repo.save(&definition("b", "bravo")).await.unwrap();
        repo.save(&definition("a", "alpha")).await.unwrap();

        let listed = repo
            .list(ListOptions {
                order_by: OrderField::Name,
                direction: OrderDirection::Asc,
                offset: 0,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(listed[0].name, "alpha");
        assert_eq!(listed[1].name, "bravo");
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let repo = repo().await;
        for i in 0..5 {
            repo.save(&definition(&format!("d{}", i), &format!("n{}", i)))
                .await
                .unwrap();
        }

        let page = repo
            .list(ListOptions {
                order_by: OrderField::Name,
                direction: OrderDirection::Asc,
                offset: 2,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].name, "n2");
    }

    #[tokio::test]
    async fn test_list_enabled_filters() {
        let repo = repo().await;
        let mut disabled = definition("off", "off");
        disabled.enabled = false;
        repo.save(&disabled).await.unwrap();
        repo.save(&definition("on", "on")).await.unwrap();

        let enabled = repo.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "on");
    }

    #[tokio::test]
    async fn test_corrupt_steps_default_to_empty() {
        let repo = repo().await;
        repo.save(&definition("d", "d")).await.unwrap();
        sqlx::query("UPDATE job_definitions SET steps = '{broken'")
            .execute(repo.store.pool())
            .await
            .unwrap();

        let loaded = repo.get("d").await.unwrap().unwrap();
        assert!(loaded.steps.is_empty());
    }
}
