//! Domain layer for the event-sourcing system.
//!
//! This crate provides:
//! - the [`Aggregate`] state-machine contract with explicit transition tables
//! - [`EsRepository`], which rehydrates aggregates from the event log and
//!   commits their buffered changes
//! - the [`Snapshotable`] projection contract used by snapshot caches

pub mod aggregate;
pub mod error;
pub mod repository;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use aggregate::{Aggregate, AggregateCore, Snapshotable, TransitionTable};
pub use error::{AggregateError, DomainError, Result};
pub use repository::{EsRepository, LoadOptions};
