// One repository per entity. Every mutating operation takes the
// repository's write mutex before touching the store so multi-statement
// mutations stay serialized on the single connection.

pub mod auth;
pub mod connector;
pub mod document;
pub mod job;
pub mod job_definition;
pub mod job_log;
pub mod kv;
pub mod seen_url;

use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

/// Decode a JSON column, substituting the default on corruption. A single
/// corrupted row must never prevent listing other rows.
pub(crate) fn decode_json_or_default<T: DeserializeOwned + Default>(raw: &str, column: &str) -> T {
    if raw.trim().is_empty() {
        return T::default();
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(column = column, error = %e, "Corrupted JSON column; using default");
            T::default()
        }
    }
}

/// Parse a stored UUID column.
pub(crate) fn parse_uuid(raw: &str, column: &str) -> Result<Uuid, crate::errors::StoreError> {
    Uuid::parse_str(raw).map_err(|e| {
        crate::errors::StoreError::QueryFailed(format!("invalid uuid in {}: {}", column, e))
    })
}

/// Map an empty string to NULL for nullable FK columns; the schema needs
/// NULL to satisfy ON DELETE SET NULL.
pub(crate) fn empty_to_null(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
