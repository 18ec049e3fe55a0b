use thiserror::Error;

/// Store-level errors shared by every repository.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Migration '{name}' (version {version}) failed: {reason}")]
    MigrationFailed {
        version: i64,
        name: String,
        reason: String,
    },

    #[error("Schema installation failed: {0}")]
    SchemaFailed(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // SQLite extended result codes: 1555/2067 unique, 787 foreign key.
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "1555" | "2067" => StoreError::DuplicateKey(db_err.message().to_string()),
                        "787" => StoreError::ForeignKeyViolation(db_err.message().to_string()),
                        _ => StoreError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    StoreError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

/// Schedule parsing errors.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("No upcoming fire time for expression '{0}'")]
    NoNextFire(String),
}

/// Validation failures on seeded or API-supplied records.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}

/// File-seeder errors. Per-section failures are downgraded to warnings by
/// the loaders; these variants surface only when a whole directory pass
/// cannot proceed.
#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Failed to read seed directory {path}: {reason}")]
    DirectoryUnreadable { path: String, reason: String },

    #[error("Failed to read seed file {path}: {reason}")]
    FileUnreadable { path: String, reason: String },

    #[error("Store error while seeding: {0}")]
    Store(#[from] StoreError),
}

/// Job execution errors.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("{0}")]
    ActionFailed(String),

    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Step '{step}' failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        step: String,
        attempts: u32,
        reason: String,
    },

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("Failure ratio {ratio:.2} exceeded tolerance {tolerance:.2}")]
    ToleranceExceeded { ratio: f64, tolerance: f64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Crawl-specific errors, reported per URL inside the worker pool.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("URL rejected by patterns: {0}")]
    Filtered(String),

    #[error("Invalid crawl pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mapping() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* *".to_string(),
            reason: "too few fields".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_execution_timeout_reason() {
        // The reaper and executor both persist this exact reason string.
        assert_eq!(ExecutionError::Timeout.to_string(), "timeout");
    }
}
