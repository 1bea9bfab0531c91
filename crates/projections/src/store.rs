//! Snapshot cache contract and the hook that writes it inside a unit of work.

use async_trait::async_trait;
use event_store::{HookError, TransactionalHook};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::SnapshotError;
use crate::filter::{FindOptions, SnapshotFilter};
use crate::snapshot::CurrentSnapshot;

/// Result type for snapshot store operations.
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

/// Queryable cache of the current state of one aggregate type.
///
/// Writes go through the event store's transaction so that a snapshot commits
/// or rolls back together with the events it reflects. Every read applies the
/// filter's deleted policy, which hides deleted snapshots by default.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Projected state type.
    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Transaction handle of the storage engine shared with the event store.
    type Transaction: Send;

    /// Name of the collection or table holding the snapshots.
    fn collection(&self) -> &str;

    /// Upserts a snapshot by id inside `tx`. A stored snapshot with a higher
    /// version is never overwritten.
    async fn save(
        &self,
        tx: &mut Self::Transaction,
        snapshot: &CurrentSnapshot<Self::State>,
    ) -> SnapshotResult<()>;

    /// Upserts a snapshot in a transaction of its own.
    ///
    /// Offers no consistency with the event log beyond its own write.
    async fn save_standalone(&self, snapshot: &CurrentSnapshot<Self::State>)
    -> SnapshotResult<()>;

    async fn find_one(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> SnapshotResult<Option<CurrentSnapshot<Self::State>>>;

    async fn find_many(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> SnapshotResult<Vec<CurrentSnapshot<Self::State>>>;

    async fn count(&self, filter: &SnapshotFilter) -> SnapshotResult<u64>;
}

/// Side effect that upserts one snapshot in the event append's unit of work.
pub struct SnapshotWrite<'a, C: SnapshotStore> {
    store: &'a C,
    snapshot: CurrentSnapshot<C::State>,
}

impl<'a, C: SnapshotStore> SnapshotWrite<'a, C> {
    pub fn new(store: &'a C, snapshot: CurrentSnapshot<C::State>) -> Self {
        Self { store, snapshot }
    }

    pub fn snapshot(&self) -> &CurrentSnapshot<C::State> {
        &self.snapshot
    }
}

#[async_trait]
impl<C: SnapshotStore> TransactionalHook<C::Transaction> for SnapshotWrite<'_, C> {
    async fn run(&self, tx: &mut C::Transaction) -> std::result::Result<(), HookError> {
        self.store.save(tx, &self.snapshot).await?;
        Ok(())
    }
}
