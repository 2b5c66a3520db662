use common::{RecordId, RecordKind};
use thiserror::Error;

/// Errors that can occur when interacting with the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write lost a race: the stored version moved on.
    #[error("Version conflict for {kind} {record_id}: expected version {expected}, found {actual}")]
    Conflict {
        kind: RecordKind,
        record_id: RecordId,
        expected: i64,
        actual: i64,
    },

    /// The record was not found in the store.
    #[error("{kind} not found: {record_id}")]
    NotFound { kind: RecordKind, record_id: RecordId },

    /// A record with the same identifier already exists.
    #[error("{kind} already exists: {record_id}")]
    Duplicate { kind: RecordKind, record_id: RecordId },

    /// A stored row could not be turned back into a record.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for failures of the store itself rather than of one record.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Migration(_))
    }
}

/// Result type for record store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
