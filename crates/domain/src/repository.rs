//! Rehydration and commit of aggregates through an event store.

use std::marker::PhantomData;

use common::AggregateId;
use event_store::{EventStore, StoredEvent, TransactionalHook, UnitOfWork};

use crate::aggregate::Aggregate;
use crate::error::Result;

/// Options for loading an aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Return aggregates whose history ends in a deletion.
    pub include_deleted: bool,
}

impl LoadOptions {
    /// Loads soft-deleted aggregates too.
    pub fn include_deleted() -> Self {
        Self {
            include_deleted: true,
        }
    }
}

/// Repository that rebuilds aggregates from their full history and appends
/// their uncommitted changes.
///
/// It never retries: a lost race surfaces as a version conflict and the
/// caller decides whether to reload and try again.
pub struct EsRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> EsRepository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    /// Creates a new repository over the given event store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate by replaying its history.
    ///
    /// Returns `None` when there is no history, and also when the aggregate
    /// is deleted unless `options.include_deleted` is set. The two cases are
    /// not distinguished.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn get_by_id(&self, id: &AggregateId, options: LoadOptions) -> Result<Option<A>> {
        let history = self.store.get_events_for_aggregate(id).await?;
        if history.is_empty() {
            return Ok(None);
        }

        let mut aggregate = A::new(id.clone());
        aggregate.load_from_history(history.into_iter().map(StoredEvent::into_event))?;

        if aggregate.is_deleted() && !options.include_deleted {
            tracing::debug!("aggregate is deleted");
            return Ok(None);
        }

        Ok(Some(aggregate))
    }

    /// Appends the aggregate's uncommitted changes, running `hook` in the
    /// same unit of work.
    ///
    /// The buffer is cleared only after a successful commit; on error it is
    /// left as it was.
    pub async fn commit(
        &self,
        aggregate: &mut A,
        hook: Option<&dyn TransactionalHook<S::Transaction>>,
    ) -> Result<()> {
        self.commit_with(aggregate, hook.into_iter().collect()).await
    }

    /// Appends the aggregate's uncommitted changes followed by every side
    /// effect, in order, as one unit of work.
    #[tracing::instrument(
        skip_all,
        fields(
            aggregate_type = A::aggregate_type(),
            aggregate_id = %aggregate.id(),
            changes = aggregate.uncommitted_changes().len(),
        )
    )]
    pub async fn commit_with(
        &self,
        aggregate: &mut A,
        side_effects: Vec<&dyn TransactionalHook<S::Transaction>>,
    ) -> Result<()> {
        let mut unit = UnitOfWork::new(aggregate.uncommitted_changes().to_vec());
        for hook in side_effects {
            unit = unit.then(hook);
        }

        self.store.commit_unit_of_work(aggregate.id(), unit).await?;
        aggregate.mark_changes_as_committed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use event_store::{
        EventStoreError, EventStoreExt, HookError, InMemoryEventStore, MemoryTransaction, Version,
    };

    use super::*;
    use crate::error::{AggregateError, DomainError};
    use crate::testing::{TestAggregate, registry};

    type Repo = EsRepository<InMemoryEventStore, TestAggregate>;

    fn repo() -> Repo {
        EsRepository::new(InMemoryEventStore::new(registry()))
    }

    struct FailingHook;

    #[async_trait]
    impl TransactionalHook<MemoryTransaction> for FailingHook {
        async fn run(&self, _tx: &mut MemoryTransaction) -> std::result::Result<(), HookError> {
            Err("side effect failed".into())
        }
    }

    #[tokio::test]
    async fn unknown_id_is_absent() {
        let found = repo()
            .get_by_id(&AggregateId::new("nope"), LoadOptions::default())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn create_change_delete_scenario() {
        let repo = repo();
        let id = AggregateId::new("A");

        let mut aggregate = TestAggregate::new(id.clone());
        aggregate.create("created").unwrap();
        repo.commit(&mut aggregate, None).await.unwrap();

        let mut loaded = repo
            .get_by_id(&id, LoadOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version(), Version::new(1));
        assert_eq!(loaded.description.as_deref(), Some("created"));

        loaded.change("changed").unwrap();
        repo.commit(&mut loaded, None).await.unwrap();

        let mut loaded = repo
            .get_by_id(&id, LoadOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version(), Version::new(2));
        assert_eq!(loaded.description.as_deref(), Some("changed"));

        loaded.delete().unwrap();
        repo.commit(&mut loaded, None).await.unwrap();

        assert!(
            repo.get_by_id(&id, LoadOptions::default())
                .await
                .unwrap()
                .is_none()
        );

        let deleted = repo
            .get_by_id(&id, LoadOptions::include_deleted())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.version(), Version::new(3));
        assert!(deleted.is_deleted());
        assert_eq!(deleted.description.as_deref(), Some("changed"));
    }

    #[tokio::test]
    async fn commit_clears_buffer_and_rehydration_matches() {
        let repo = repo();
        let id = AggregateId::new("A");

        let mut aggregate = TestAggregate::new(id.clone());
        aggregate.create("one").unwrap();
        aggregate.unique("u-1").unwrap();
        aggregate.annotate("internal").unwrap();
        aggregate.change("two").unwrap();
        repo.commit(&mut aggregate, None).await.unwrap();

        assert!(aggregate.uncommitted_changes().is_empty());

        let loaded = repo
            .get_by_id(&id, LoadOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, aggregate);
        assert_eq!(loaded.version(), Version::new(4));
    }

    #[tokio::test]
    async fn failed_commit_keeps_buffer() {
        let repo = repo();
        let mut aggregate = TestAggregate::new(AggregateId::new("A"));
        aggregate.create("created").unwrap();

        let result = repo.commit(&mut aggregate, Some(&FailingHook)).await;

        assert!(matches!(
            result,
            Err(DomainError::EventStore(EventStoreError::HookFailure(_)))
        ));
        assert_eq!(aggregate.uncommitted_changes().len(), 1);
        assert!(
            !repo
                .store()
                .aggregate_exists(&AggregateId::new("A"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn concurrent_commits_exactly_one_wins() {
        let repo = repo();
        let id = AggregateId::new("A");

        let mut aggregate = TestAggregate::new(id.clone());
        aggregate.create("created").unwrap();
        repo.commit(&mut aggregate, None).await.unwrap();

        let mut first = repo
            .get_by_id(&id, LoadOptions::default())
            .await
            .unwrap()
            .unwrap();
        let mut second = repo
            .get_by_id(&id, LoadOptions::default())
            .await
            .unwrap()
            .unwrap();
        first.change("first").unwrap();
        second.change("second").unwrap();

        let (a, b) = tokio::join!(
            repo.commit(&mut first, None),
            repo.commit(&mut second, None)
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(e) if e.is_version_conflict()))
                .count(),
            1
        );

        let loser = if first.uncommitted_changes().is_empty() {
            &second
        } else {
            &first
        };
        assert_eq!(loser.uncommitted_changes().len(), 1);

        let events = repo.store().get_events_for_aggregate(&id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn loser_can_reload_and_retry() {
        let repo = repo();
        let id = AggregateId::new("A");

        let mut writer = TestAggregate::new(id.clone());
        writer.create("created").unwrap();
        repo.commit(&mut writer, None).await.unwrap();

        let mut stale = TestAggregate::new(id.clone());
        stale.create("again").unwrap();
        let error = repo.commit(&mut stale, None).await.unwrap_err();
        assert!(error.is_version_conflict());

        let mut fresh = repo
            .get_by_id(&id, LoadOptions::default())
            .await
            .unwrap()
            .unwrap();
        fresh.change("retried").unwrap();
        repo.commit(&mut fresh, None).await.unwrap();

        assert_eq!(fresh.version(), Version::new(2));
    }

    #[tokio::test]
    async fn event_without_handler_fails_before_commit() {
        let mut aggregate = TestAggregate::new(AggregateId::new("A"));
        aggregate.create("created").unwrap();

        let result = aggregate.archive();

        assert!(matches!(result, Err(AggregateError::MissingHandler { .. })));
        assert_eq!(aggregate.uncommitted_changes().len(), 1);
    }

    #[tokio::test]
    async fn stored_event_without_handler_fails_rehydration() {
        let repo = repo();
        let id = AggregateId::new("A");
        let archived = event_store::Event::from_domain(
            id.clone(),
            &crate::testing::AggregateArchived {},
        )
        .unwrap()
        .with_version(Version::first());
        repo.store()
            .save_events(&id, vec![archived], None)
            .await
            .unwrap();

        let result = repo.get_by_id(&id, LoadOptions::default()).await;

        assert!(matches!(
            result,
            Err(DomainError::Aggregate(AggregateError::MissingHandler { .. }))
        ));
    }
}
