//! Append-only event log with per-aggregate optimistic concurrency.
//!
//! The [`EventStore`] trait is implemented by [`InMemoryEventStore`] and
//! [`PostgresEventStore`]. Appends run as a [`UnitOfWork`]: the event batch
//! plus any [`TransactionalHook`] side effects commit or roll back together.

pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod publisher;
pub mod query;
pub mod registry;
pub mod store;

pub use common::AggregateId;
pub use config::EventStoreConfig;
pub use error::{EventStoreError, HookError, Result};
pub use event::{DomainEvent, Event, EventId, EventRecord, StoredEvent, Version, Visibility};
pub use memory::{InMemoryEventStore, MemoryDatabase, MemoryTransaction, UniqueViolation};
pub use postgres::PostgresEventStore;
pub use publisher::{EventPublisher, InMemoryPublisher, PublishEntry, PublishError};
pub use query::{EventCursor, EventFeedQuery, InvalidCursor, ScanOptions};
pub use registry::EventRegistry;
pub use store::{
    EventStore, EventStoreExt, EventStream, TransactionalHook, UnitOfWork, validate_batch,
};
