//! Repository that keeps the snapshot cache consistent with the event log.

use common::AggregateId;
use domain::{DomainError, EsRepository, LoadOptions, Snapshotable};
use event_store::{EventStore, ScanOptions, TransactionalHook};

use crate::error::Result;
use crate::filter::{FindOptions, SnapshotFilter};
use crate::snapshot::CurrentSnapshot;
use crate::store::{SnapshotStore, SnapshotWrite};

/// Composes an [`EsRepository`] with a [`SnapshotStore`] sharing the same
/// storage engine.
///
/// Writes go to the log and the snapshot in one unit of work. Reads come
/// either from the log (authoritative) or from the snapshot cache.
pub struct PragmaticRepository<S, C, A>
where
    S: EventStore,
    A: Snapshotable,
    C: SnapshotStore<State = A::State, Transaction = S::Transaction>,
{
    es: EsRepository<S, A>,
    snapshots: C,
}

impl<S, C, A> PragmaticRepository<S, C, A>
where
    S: EventStore,
    A: Snapshotable,
    C: SnapshotStore<State = A::State, Transaction = S::Transaction>,
{
    pub fn new(store: S, snapshots: C) -> Self {
        Self::from_parts(EsRepository::new(store), snapshots)
    }

    pub fn from_parts(es: EsRepository<S, A>, snapshots: C) -> Self {
        Self { es, snapshots }
    }

    pub fn es_repository(&self) -> &EsRepository<S, A> {
        &self.es
    }

    pub fn snapshots(&self) -> &C {
        &self.snapshots
    }

    /// Loads an aggregate from its event history.
    pub async fn get_by_id_from_es(
        &self,
        id: &AggregateId,
        options: LoadOptions,
    ) -> Result<Option<A>> {
        Ok(self.es.get_by_id(id, options).await?)
    }

    /// Appends the aggregate's changes and upserts its snapshot atomically.
    ///
    /// A version conflict or a snapshot unique-index violation fails the
    /// whole call; neither the events nor the snapshot are written and the
    /// aggregate keeps its uncommitted changes.
    #[tracing::instrument(
        skip_all,
        fields(aggregate_type = A::aggregate_type(), aggregate_id = %aggregate.id())
    )]
    pub async fn commit_and_save(&self, aggregate: &mut A) -> Result<()> {
        let write = SnapshotWrite::new(&self.snapshots, CurrentSnapshot::of(&*aggregate));
        let hook: &dyn TransactionalHook<S::Transaction> = &write;

        self.es.commit(aggregate, Some(hook)).await?;

        metrics::counter!("snapshots_written_total", "aggregate_type" => A::aggregate_type())
            .increment(1);
        Ok(())
    }

    pub async fn find_one_from_current_snapshot(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> Result<Option<CurrentSnapshot<A::State>>> {
        Ok(self.snapshots.find_one(filter, options).await?)
    }

    pub async fn find_many_from_current_snapshot(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> Result<Vec<CurrentSnapshot<A::State>>> {
        Ok(self.snapshots.find_many(filter, options).await?)
    }

    pub async fn count_from_current_snapshot(&self, filter: &SnapshotFilter) -> Result<u64> {
        Ok(self.snapshots.count(filter).await?)
    }

    /// Rewrites one snapshot from the event log, deleted aggregates included.
    ///
    /// Returns `false` when the aggregate has no history. The write goes
    /// through an empty unit of work so it shares the store's transaction.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn rebuild_snapshot(&self, id: &AggregateId) -> Result<bool> {
        let Some(aggregate) = self.es.get_by_id(id, LoadOptions::include_deleted()).await? else {
            tracing::debug!("no history, nothing to rebuild");
            return Ok(false);
        };

        let write = SnapshotWrite::new(&self.snapshots, CurrentSnapshot::of(&aggregate));
        let hook: &dyn TransactionalHook<S::Transaction> = &write;
        self.es
            .store()
            .save_events(id, Vec::new(), Some(hook))
            .await
            .map_err(DomainError::from)?;

        metrics::counter!("snapshots_rebuilt_total", "aggregate_type" => A::aggregate_type())
            .increment(1);
        Ok(true)
    }

    /// Rewrites the snapshot of every aggregate whose history contains one of
    /// this aggregate type's events. Returns the number rebuilt.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn rebuild_all_snapshots(&self) -> Result<usize> {
        let event_names: Vec<String> = A::transitions()
            .event_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let ids = self
            .es
            .store()
            .get_distinct_aggregate_ids(Some(&event_names), ScanOptions::large())
            .await
            .map_err(DomainError::from)?;

        let mut rebuilt = 0;
        for id in &ids {
            if self.rebuild_snapshot(id).await? {
                rebuilt += 1;
            }
        }

        tracing::info!(rebuilt, "snapshots rebuilt");
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use domain::Aggregate;
    use domain::testing::{TestAggregate, registry};
    use event_store::{InMemoryEventStore, MemoryDatabase, Version};

    use super::*;
    use crate::memory::InMemorySnapshotStore;

    type Repo = PragmaticRepository<
        InMemoryEventStore,
        InMemorySnapshotStore<domain::testing::TestAggregateState>,
        TestAggregate,
    >;

    fn repo() -> Repo {
        let database = MemoryDatabase::new();
        PragmaticRepository::new(
            InMemoryEventStore::with_database(database.clone(), registry()),
            InMemorySnapshotStore::new(database, TestAggregate::aggregate_type()),
        )
    }

    #[tokio::test]
    async fn commit_and_save_writes_both_sides() {
        let repo = repo();
        let id = AggregateId::new("A");
        let mut aggregate = TestAggregate::new(id.clone());
        aggregate.create("created").unwrap();

        repo.commit_and_save(&mut aggregate).await.unwrap();

        assert!(aggregate.uncommitted_changes().is_empty());
        let snapshot = repo
            .find_one_from_current_snapshot(&SnapshotFilter::by_id("A"), &FindOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.version, Version::new(1));
        assert_eq!(snapshot.state.description.as_deref(), Some("created"));

        let loaded = repo
            .get_by_id_from_es(&id, LoadOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, aggregate);
    }

    #[tokio::test]
    async fn rebuild_of_unknown_id_is_a_no_op() {
        let repo = repo();
        assert!(!repo.rebuild_snapshot(&AggregateId::new("nope")).await.unwrap());
        assert_eq!(
            repo.count_from_current_snapshot(&SnapshotFilter::new().include_deleted())
                .await
                .unwrap(),
            0
        );
    }
}
