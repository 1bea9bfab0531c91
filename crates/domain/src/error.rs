//! Domain error types.

use common::AggregateId;
use event_store::{EventStoreError, Version};
use thiserror::Error;

/// Errors raised by an aggregate while applying or replaying events.
///
/// None of these are retryable: they point at a programming or deployment
/// mistake rather than a race.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The event type is known but this aggregate type has no transition
    /// for it.
    #[error("Aggregate {aggregate_type} has no handler for event {event_name}")]
    MissingHandler {
        aggregate_type: &'static str,
        event_name: String,
    },

    /// The payload does not decode into the event type registered under its
    /// name.
    #[error("Invalid payload for event {event_name}: {source}")]
    InvalidPayload {
        event_name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Replayed history skips or repeats a version.
    #[error("Out of order history: expected version {expected}, found {found}")]
    OutOfOrderHistory { expected: Version, found: Version },

    /// The event belongs to another aggregate.
    #[error("Event for aggregate {found} applied to aggregate {expected}")]
    ForeignEvent {
        expected: AggregateId,
        found: AggregateId,
    },
}

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// An aggregate rejected an event.
    #[error("Aggregate error: {0}")]
    Aggregate(#[from] AggregateError),
}

impl DomainError {
    /// Returns true if the commit lost an optimistic-concurrency race.
    /// Callers decide whether to reload and retry.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_version_conflict())
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
