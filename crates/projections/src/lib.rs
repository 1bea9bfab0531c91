//! Current-state snapshot cache for event-sourced aggregates.
//!
//! This crate provides:
//! - [`SnapshotStore`], a queryable cache of each aggregate's current state,
//!   with in-memory and PostgreSQL implementations
//! - [`SnapshotWrite`], the hook that upserts a snapshot inside the event
//!   append's unit of work
//! - [`PragmaticRepository`], which commits events and snapshot together and
//!   serves reads from either side

pub mod error;
pub mod filter;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod snapshot;
pub mod store;

pub use error::{RepositoryError, Result, SnapshotError};
pub use filter::{DeletedFilter, FindOptions, SnapshotFilter, SortKey, SortOrder};
pub use memory::InMemorySnapshotStore;
pub use postgres::PostgresSnapshotStore;
pub use repository::PragmaticRepository;
pub use snapshot::CurrentSnapshot;
pub use store::{SnapshotResult, SnapshotStore, SnapshotWrite};
