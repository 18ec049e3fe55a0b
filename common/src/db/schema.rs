// Baseline schema, applied idempotently on every open.
//
// This is the original table layout; everything added later lives in
// `migrations`. Statements use IF NOT EXISTS throughout so reapplying on an
// existing store is a no-op.

use crate::errors::StoreError;
use sqlx::SqlitePool;
use tracing::{debug, warn};

const BASELINE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version     INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    applied_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_credentials (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    auth_type    TEXT NOT NULL DEFAULT 'cookie',
    site_domain  TEXT UNIQUE,
    service_type TEXT NOT NULL DEFAULT '',
    base_url     TEXT NOT NULL DEFAULT '',
    user_agent   TEXT NOT NULL DEFAULT '',
    cookies      TEXT NOT NULL DEFAULT '',
    tokens       TEXT NOT NULL DEFAULT '{}',
    data         TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    UNIQUE (name, auth_type)
);

CREATE TABLE IF NOT EXISTS key_values (
    id             TEXT PRIMARY KEY,
    key            TEXT NOT NULL,
    key_normalized TEXT NOT NULL UNIQUE,
    value          TEXT NOT NULL,
    description    TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS connectors (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    name_normalized TEXT NOT NULL UNIQUE,
    type            TEXT NOT NULL,
    config          TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_definitions (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    type            TEXT NOT NULL DEFAULT 'crawler',
    job_type        TEXT NOT NULL DEFAULT 'user',
    description     TEXT NOT NULL DEFAULT '',
    source_type     TEXT NOT NULL DEFAULT '',
    base_url        TEXT NOT NULL DEFAULT '',
    auth_id         TEXT REFERENCES auth_credentials(id) ON DELETE SET NULL,
    steps           TEXT NOT NULL DEFAULT '[]',
    schedule        TEXT NOT NULL DEFAULT '',
    timeout         TEXT NOT NULL DEFAULT '',
    enabled         INTEGER NOT NULL DEFAULT 1,
    auto_start      INTEGER NOT NULL DEFAULT 0,
    config          TEXT NOT NULL DEFAULT '{}',
    pre_jobs        TEXT NOT NULL DEFAULT '[]',
    post_jobs       TEXT NOT NULL DEFAULT '[]',
    error_tolerance TEXT,
    raw_source      TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_definitions_enabled ON job_definitions (enabled);
CREATE INDEX IF NOT EXISTS idx_job_definitions_type ON job_definitions (type);

CREATE TABLE IF NOT EXISTS jobs (
    id                     TEXT PRIMARY KEY,
    definition_id          TEXT,
    job_type               TEXT NOT NULL DEFAULT '',
    name                   TEXT NOT NULL DEFAULT '',
    description            TEXT NOT NULL DEFAULT '',
    source_type            TEXT NOT NULL DEFAULT '',
    entity_type            TEXT NOT NULL DEFAULT '',
    config                 TEXT NOT NULL DEFAULT '{}',
    source_config_snapshot TEXT NOT NULL DEFAULT '{}',
    auth_snapshot          TEXT,
    refresh_source         INTEGER NOT NULL DEFAULT 0,
    seed_urls              TEXT NOT NULL DEFAULT '[]',
    status                 TEXT NOT NULL DEFAULT 'pending',
    progress               TEXT NOT NULL DEFAULT '{}',
    created_at             TEXT NOT NULL,
    started_at             TEXT,
    completed_at           TEXT,
    finished_at            TEXT,
    last_heartbeat         TEXT,
    error                  TEXT,
    result_count           INTEGER NOT NULL DEFAULT 0,
    failed_count           INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
CREATE INDEX IF NOT EXISTS idx_jobs_definition ON jobs (definition_id);

CREATE TABLE IF NOT EXISTS job_logs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    timestamp  TEXT NOT NULL,
    level      TEXT NOT NULL,
    message    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs (job_id, id);

CREATE TABLE IF NOT EXISTS seen_urls (
    job_id     TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    url        TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (job_id, url)
);

CREATE TABLE IF NOT EXISTS documents (
    id               TEXT PRIMARY KEY,
    source_type      TEXT NOT NULL,
    source_id        TEXT NOT NULL,
    title            TEXT NOT NULL DEFAULT '',
    content_markdown TEXT NOT NULL DEFAULT '',
    metadata         TEXT NOT NULL DEFAULT '{}',
    url              TEXT NOT NULL DEFAULT '',
    synced           INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    UNIQUE (source_type, source_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_source ON documents (source_type);
"#;

/// Full-text mirror of (title, content_markdown), kept in sync by triggers.
/// Created separately because FTS5 availability depends on how the bundled
/// library was compiled; absence downgrades to a warning.
const FTS: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5 (
    title,
    content_markdown,
    content='documents',
    content_rowid='rowid'
);
"#;

pub(crate) const FTS_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS documents_fts_insert AFTER INSERT ON documents BEGIN
    INSERT INTO documents_fts (rowid, title, content_markdown)
    VALUES (new.rowid, new.title, new.content_markdown);
END;

CREATE TRIGGER IF NOT EXISTS documents_fts_delete AFTER DELETE ON documents BEGIN
    INSERT INTO documents_fts (documents_fts, rowid, title, content_markdown)
    VALUES ('delete', old.rowid, old.title, old.content_markdown);
END;

CREATE TRIGGER IF NOT EXISTS documents_fts_update AFTER UPDATE ON documents BEGIN
    INSERT INTO documents_fts (documents_fts, rowid, title, content_markdown)
    VALUES ('delete', old.rowid, old.title, old.content_markdown);
    INSERT INTO documents_fts (rowid, title, content_markdown)
    VALUES (new.rowid, new.title, new.content_markdown);
END;
"#;

/// Apply the baseline schema. Safe to call on every open.
pub async fn install(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(BASELINE)
        .execute(pool)
        .await
        .map_err(|e| StoreError::SchemaFailed(e.to_string()))?;

    match sqlx::raw_sql(FTS).execute(pool).await {
        Ok(_) => {
            sqlx::raw_sql(FTS_TRIGGERS)
                .execute(pool)
                .await
                .map_err(|e| StoreError::SchemaFailed(e.to_string()))?;
            debug!("Full-text index ready");
        }
        Err(e) => {
            warn!(error = %e, "FTS5 unavailable; full-text index disabled");
        }
    }

    Ok(())
}
