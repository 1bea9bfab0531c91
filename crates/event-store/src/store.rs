use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{TryStreamExt, stream};

use crate::{
    AggregateId, Event, EventCursor, EventFeedQuery, EventRegistry, EventStoreError, HookError,
    Result, ScanOptions, StoredEvent, Version,
};

/// A side effect that runs inside the same unit of work as an event append.
///
/// `Tx` is the storage engine's transaction handle. Whatever the hook writes
/// through it commits or rolls back together with the events.
#[async_trait]
pub trait TransactionalHook<Tx: Send>: Send + Sync {
    async fn run(&self, tx: &mut Tx) -> std::result::Result<(), HookError>;
}

/// An ordered, all-or-nothing group of writes against one aggregate key:
/// the event batch first, then every side effect in the order added.
pub struct UnitOfWork<'a, Tx: Send> {
    events: Vec<Event>,
    side_effects: Vec<&'a dyn TransactionalHook<Tx>>,
}

impl<'a, Tx: Send> UnitOfWork<'a, Tx> {
    /// Starts a unit of work appending the given events.
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            side_effects: Vec::new(),
        }
    }

    /// Adds a side effect executed after the events and any earlier hooks.
    pub fn then(mut self, hook: &'a dyn TransactionalHook<Tx>) -> Self {
        self.side_effects.push(hook);
        self
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn side_effect_count(&self) -> usize {
        self.side_effects.len()
    }

    pub fn into_parts(self) -> (Vec<Event>, Vec<&'a dyn TransactionalHook<Tx>>) {
        (self.events, self.side_effects)
    }
}

/// A stream of stored events.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<StoredEvent>> + Send + 'a>>;

/// Core trait for event store implementations.
///
/// An event store is an append-only log. The pair (aggregate id, version) is
/// unique across the whole log and is the only concurrency control: when two
/// writers propose the same next version, exactly one unit of work commits and
/// the other fails with [`EventStoreError::VersionConflict`].
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Transaction handle passed to hooks.
    type Transaction: Send;

    /// Returns the registry used to validate and reconstruct events.
    fn registry(&self) -> &EventRegistry;

    /// Executes a unit of work atomically and in isolation.
    ///
    /// After a successful commit the public events of the batch are handed to
    /// the publisher, if one is configured. Publication is not part of the
    /// unit of work and its failure is never returned.
    async fn commit_unit_of_work(
        &self,
        aggregate_id: &AggregateId,
        unit: UnitOfWork<'_, Self::Transaction>,
    ) -> Result<()>;

    /// Appends `events` and runs the optional `hook` in the same unit of work.
    ///
    /// An empty batch is a valid call: the hook still runs and nothing is
    /// published.
    async fn save_events(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<Event>,
        hook: Option<&dyn TransactionalHook<Self::Transaction>>,
    ) -> Result<()> {
        let mut unit = UnitOfWork::new(events);
        if let Some(hook) = hook {
            unit = unit.then(hook);
        }
        self.commit_unit_of_work(aggregate_id, unit).await
    }

    /// Returns all events of an aggregate ordered by version, oldest first.
    async fn get_events_for_aggregate(&self, aggregate_id: &AggregateId)
    -> Result<Vec<StoredEvent>>;

    /// Reads the global feed in insertion order.
    async fn get_all_events(&self, query: EventFeedQuery) -> Result<Vec<StoredEvent>>;

    /// Returns the ids of aggregates with at least one matching event,
    /// sorted by id.
    async fn get_distinct_aggregate_ids(
        &self,
        event_names: Option<&[String]>,
        options: ScanOptions,
    ) -> Result<Vec<AggregateId>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Checks if an aggregate has any events.
    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> Result<bool> {
        Ok(!self.get_events_for_aggregate(aggregate_id).await?.is_empty())
    }

    /// Returns the version of the last event of an aggregate.
    async fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version> {
        Ok(self
            .get_events_for_aggregate(aggregate_id)
            .await?
            .last()
            .map(|stored| stored.event.aggregate_version())
            .unwrap_or_default())
    }

    /// Streams the whole feed page by page, resuming each page strictly after
    /// the last cursor seen.
    fn scan_all(&self, page_size: usize, event_names: Option<Vec<String>>) -> EventStream<'_> {
        let page_size = page_size.max(1);

        let pages = stream::try_unfold(Some(None::<EventCursor>), move |state| {
            let event_names = event_names.clone();
            async move {
                let Some(after) = state else {
                    return Ok::<_, EventStoreError>(None);
                };

                let query = EventFeedQuery {
                    skip: 0,
                    limit: Some(page_size),
                    event_names,
                    after,
                };
                let page = self.get_all_events(query).await?;
                let next = (page.len() == page_size).then(|| page.last().map(|e| e.cursor));
                Ok(Some((page, next)))
            }
        });

        Box::pin(
            pages
                .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, EventStoreError>)))
                .try_flatten(),
        )
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Records a lost concurrency race and builds the matching error.
pub(crate) fn version_conflict(aggregate_id: &AggregateId, version: Version) -> EventStoreError {
    metrics::counter!("event_store_version_conflicts_total").increment(1);
    tracing::warn!(%aggregate_id, %version, "version conflict, unit of work rolled back");
    EventStoreError::VersionConflict {
        aggregate_id: aggregate_id.clone(),
        version,
    }
}

/// Records a failed side effect and builds the matching error.
pub(crate) fn hook_failure(error: HookError) -> EventStoreError {
    metrics::counter!("event_store_hook_failures_total").increment(1);
    tracing::warn!(%error, "transactional hook failed, unit of work rolled back");
    EventStoreError::HookFailure(error)
}

/// Validates a batch before it is appended for `aggregate_id`.
///
/// Every event must belong to the aggregate and versions must increase by
/// exactly one, starting at 1 or above.
pub fn validate_batch(aggregate_id: &AggregateId, events: &[Event]) -> Result<()> {
    let mut previous: Option<Version> = None;

    for event in events {
        if event.aggregate_id() != aggregate_id {
            return Err(EventStoreError::InvalidBatch(format!(
                "event {} belongs to aggregate {}, not {}",
                event.event_id(),
                event.aggregate_id(),
                aggregate_id
            )));
        }

        let version = event.aggregate_version();
        let valid = match previous {
            None => version >= Version::first(),
            Some(previous) => version == previous.next(),
        };
        if !valid {
            return Err(EventStoreError::InvalidBatch(format!(
                "event versions must be sequential, got {version} after {}",
                previous.unwrap_or_default()
            )));
        }
        previous = Some(version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Visibility;

    fn event(aggregate_id: &str, version: i64) -> Event {
        Event::new(
            AggregateId::new(aggregate_id),
            "Touched",
            serde_json::json!({}),
            Visibility::Public,
        )
        .with_version(Version::new(version))
    }

    #[test]
    fn empty_batch_is_valid() {
        assert!(validate_batch(&AggregateId::new("a"), &[]).is_ok());
    }

    #[test]
    fn sequential_batch_is_valid() {
        let events = vec![event("a", 3), event("a", 4), event("a", 5)];
        assert!(validate_batch(&AggregateId::new("a"), &events).is_ok());
    }

    #[test]
    fn gap_is_rejected() {
        let events = vec![event("a", 1), event("a", 3)];
        assert!(matches!(
            validate_batch(&AggregateId::new("a"), &events),
            Err(EventStoreError::InvalidBatch(_))
        ));
    }

    #[test]
    fn unversioned_event_is_rejected() {
        let events = vec![event("a", 0)];
        assert!(validate_batch(&AggregateId::new("a"), &events).is_err());
    }

    #[test]
    fn foreign_aggregate_is_rejected() {
        let events = vec![event("a", 1), event("b", 2)];
        assert!(validate_batch(&AggregateId::new("a"), &events).is_err());
    }
}
