use thiserror::Error;

use crate::{AggregateId, Version};

/// Boxed error produced by a caller-supplied transactional hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer already appended this version for the aggregate.
    /// The whole unit of work was rolled back; reload and retry.
    #[error("Version conflict for aggregate {aggregate_id}: version {version} already exists")]
    VersionConflict {
        aggregate_id: AggregateId,
        version: Version,
    },

    /// No event type is registered under this name.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A side effect executed inside the unit of work failed.
    /// The original error is kept as the source.
    #[error("Transactional hook failed: {0}")]
    HookFailure(#[source] HookError),

    /// The event batch is malformed (wrong aggregate or non-sequential versions).
    #[error("Invalid event batch: {0}")]
    InvalidBatch(String),

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

impl EventStoreError {
    /// Returns true if this error reports a lost optimistic-concurrency race.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, EventStoreError::VersionConflict { .. })
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
