//! Shared types used across the event-sourcing crates.

pub mod types;

pub use types::AggregateId;
