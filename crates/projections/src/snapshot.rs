use chrono::{DateTime, Utc};
use common::AggregateId;
use domain::Snapshotable;
use event_store::Version;
use serde::{Deserialize, Serialize};

/// Current state of one aggregate as stored in the snapshot cache.
///
/// A cache entry, never authoritative: it can be dropped and rebuilt from the
/// event log at any time. `version` is the version of the last event folded
/// into `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentSnapshot<S> {
    pub id: AggregateId,
    pub version: Version,
    pub deleted: bool,
    pub state: S,
    pub updated_at: DateTime<Utc>,
}

impl<S> CurrentSnapshot<S> {
    /// Projects the aggregate's current state, including uncommitted changes.
    pub fn of<A>(aggregate: &A) -> Self
    where
        A: Snapshotable<State = S>,
    {
        Self {
            id: aggregate.id().clone(),
            version: aggregate.version(),
            deleted: aggregate.is_deleted(),
            state: aggregate.snapshot_state(),
            updated_at: Utc::now(),
        }
    }
}
