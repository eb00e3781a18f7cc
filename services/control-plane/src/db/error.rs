//! Store error types.

use thiserror::Error;

/// Persistence errors shared by every [`Store`](super::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or the query failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record with the same id or unique key already exists.
    #[error("conflict in {collection}: {detail}")]
    Conflict { collection: String, detail: String },

    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },

    /// A stored record does not decode into, or encode from, its domain type.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn conflict(collection: &str, detail: impl Into<String>) -> Self {
        StoreError::Conflict {
            collection: collection.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether a caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}
