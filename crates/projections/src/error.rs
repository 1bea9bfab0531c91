//! Snapshot cache and repository error types.

use domain::DomainError;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors raised by a snapshot store.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Another snapshot already holds this value for a unique index.
    #[error("Unique index {index} violated in {collection}")]
    UniqueViolation { collection: String, index: String },

    /// Collection, table or field name that cannot be used as an identifier.
    #[error("Invalid collection name: {0}")]
    InvalidCollectionName(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<event_store::UniqueViolation> for SnapshotError {
    fn from(violation: event_store::UniqueViolation) -> Self {
        SnapshotError::UniqueViolation {
            collection: violation.collection,
            index: violation.index,
        }
    }
}

/// Errors returned by [`crate::PragmaticRepository`].
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Loading or committing the aggregate failed.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Reading the snapshot cache failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl RepositoryError {
    /// Returns true if the commit lost an optimistic-concurrency race.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, RepositoryError::Domain(e) if e.is_version_conflict())
    }

    /// Returns the snapshot error that made a commit roll back, if any.
    pub fn snapshot_failure(&self) -> Option<&SnapshotError> {
        match self {
            RepositoryError::Snapshot(e) => Some(e),
            RepositoryError::Domain(DomainError::EventStore(EventStoreError::HookFailure(
                source,
            ))) => source.downcast_ref::<SnapshotError>(),
            _ => None,
        }
    }

    /// Returns true if a snapshot unique index rejected the commit, whether
    /// detected when the snapshot was staged or when the unit of work
    /// committed.
    pub fn is_unique_violation(&self) -> bool {
        if matches!(
            self.snapshot_failure(),
            Some(SnapshotError::UniqueViolation { .. })
        ) {
            return true;
        }
        matches!(
            self,
            RepositoryError::Domain(DomainError::EventStore(EventStoreError::HookFailure(source)))
                if source.is::<event_store::UniqueViolation>()
        )
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
