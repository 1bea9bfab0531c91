use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{
    AggregateId, Event, EventCursor, EventFeedQuery, EventRecord, EventRegistry, Result,
    ScanOptions, StoredEvent, Version,
    publisher::{EventPublisher, publish_committed},
    store::{EventStore, UnitOfWork, hook_failure, validate_batch, version_conflict},
};

/// A write would give two documents the same value for a unique index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unique index {index} violated in collection {collection} by document {document_id}")]
pub struct UniqueViolation {
    pub collection: String,
    pub index: String,
    pub document_id: String,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    sequence: i64,
    record: EventRecord,
    recorded_at: DateTime<Utc>,
}

/// JSON documents keyed by id, with optional unique indexes addressed by
/// JSON pointer (e.g. `/state/email`). Null or missing values are not indexed.
#[derive(Debug, Clone, Default)]
struct Collection {
    documents: BTreeMap<String, serde_json::Value>,
    unique_indexes: Vec<String>,
}

impl Collection {
    fn check(
        &self,
        name: &str,
        id: &str,
        document: &serde_json::Value,
    ) -> std::result::Result<(), UniqueViolation> {
        for index in &self.unique_indexes {
            let Some(value) = document.pointer(index).filter(|v| !v.is_null()) else {
                continue;
            };
            let taken = self
                .documents
                .iter()
                .any(|(other_id, other)| other_id != id && other.pointer(index) == Some(value));
            if taken {
                return Err(UniqueViolation {
                    collection: name.to_string(),
                    index: index.clone(),
                    document_id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Inserts or replaces a document. With `monotonic`, a write whose
    /// integer at that pointer is lower than the stored one is skipped.
    fn upsert(
        &mut self,
        name: &str,
        id: &str,
        document: serde_json::Value,
        monotonic: Option<&str>,
    ) -> std::result::Result<(), UniqueViolation> {
        if let Some(pointer) = monotonic
            && let Some(current) = self.documents.get(id)
            && supersedes(current, &document, pointer)
        {
            return Ok(());
        }
        self.check(name, id, &document)?;
        self.documents.insert(id.to_string(), document);
        Ok(())
    }
}

fn supersedes(current: &serde_json::Value, incoming: &serde_json::Value, pointer: &str) -> bool {
    let stored = current.pointer(pointer).and_then(serde_json::Value::as_i64);
    let proposed = incoming.pointer(pointer).and_then(serde_json::Value::as_i64);
    matches!((stored, proposed), (Some(stored), Some(proposed)) if stored > proposed)
}

#[derive(Debug, Clone)]
struct DocumentWrite {
    collection: String,
    id: String,
    document: serde_json::Value,
    monotonic: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    events: Vec<StoredRecord>,
    versions: HashSet<(AggregateId, Version)>,
    next_sequence: i64,
    collections: HashMap<String, Collection>,
}

impl Tables {
    /// Applies writes in order to copies of the touched collections.
    fn stage_documents(
        &self,
        writes: &[DocumentWrite],
    ) -> std::result::Result<HashMap<String, Collection>, UniqueViolation> {
        let mut touched: HashMap<String, Collection> = HashMap::new();
        for write in writes {
            let collection = touched
                .entry(write.collection.clone())
                .or_insert_with(|| {
                    self.collections
                        .get(&write.collection)
                        .cloned()
                        .unwrap_or_default()
                });
            collection.upsert(
                &write.collection,
                &write.id,
                write.document.clone(),
                write.monotonic.as_deref(),
            )?;
        }
        Ok(touched)
    }
}

enum CommitError {
    VersionConflict {
        aggregate_id: AggregateId,
        version: Version,
    },
    Document(UniqueViolation),
}

/// Transactional in-memory storage shared by the event log and any document
/// collections written by hooks (such as snapshot caches).
///
/// Writes are staged in a [`MemoryTransaction`] and applied all at once on
/// commit, after every constraint has been checked under a single write lock.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction. Nothing it stages is visible until commit.
    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            database: self.clone(),
            events: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Adds a unique index on a collection, creating the collection if needed.
    ///
    /// Fails if existing documents already violate it.
    pub async fn create_unique_index(
        &self,
        collection: &str,
        pointer: impl Into<String>,
    ) -> std::result::Result<(), UniqueViolation> {
        let pointer = pointer.into();
        let mut tables = self.tables.write().await;
        let current = tables.collections.entry(collection.to_string()).or_default();
        if current.unique_indexes.contains(&pointer) {
            return Ok(());
        }

        let mut rebuilt = Collection {
            documents: BTreeMap::new(),
            unique_indexes: vec![pointer.clone()],
        };
        for (id, document) in &current.documents {
            rebuilt.upsert(collection, id, document.clone(), None)?;
        }
        current.unique_indexes.push(pointer);
        Ok(())
    }

    /// Removes a unique index if present.
    pub async fn drop_unique_index(&self, collection: &str, pointer: &str) {
        if let Some(current) = self.tables.write().await.collections.get_mut(collection) {
            current.unique_indexes.retain(|index| index != pointer);
        }
    }

    /// Returns the committed documents of a collection ordered by id.
    pub async fn documents(&self, collection: &str) -> Vec<serde_json::Value> {
        self.tables
            .read()
            .await
            .collections
            .get(collection)
            .map(|c| c.documents.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns one committed document.
    pub async fn document(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.tables
            .read()
            .await
            .collections
            .get(collection)
            .and_then(|c| c.documents.get(id).cloned())
    }

    /// Removes every document from a collection, keeping its indexes.
    pub async fn clear_collection(&self, collection: &str) {
        if let Some(current) = self.tables.write().await.collections.get_mut(collection) {
            current.documents.clear();
        }
    }

    /// Returns the total number of committed events.
    pub async fn event_count(&self) -> usize {
        self.tables.read().await.events.len()
    }

    /// Clears all events and collections.
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        *tables = Tables::default();
    }

    async fn commit(&self, tx: MemoryTransaction) -> std::result::Result<(), CommitError> {
        let MemoryTransaction { events, writes, .. } = tx;
        let mut tables = self.tables.write().await;

        let mut proposed = HashSet::new();
        for event in &events {
            let key = (event.aggregate_id().clone(), event.aggregate_version());
            if tables.versions.contains(&key) || !proposed.insert(key) {
                return Err(CommitError::VersionConflict {
                    aggregate_id: event.aggregate_id().clone(),
                    version: event.aggregate_version(),
                });
            }
        }

        let staged = tables
            .stage_documents(&writes)
            .map_err(CommitError::Document)?;
        tables.collections.extend(staged);

        let recorded_at = Utc::now();
        for event in &events {
            tables.next_sequence += 1;
            let sequence = tables.next_sequence;
            tables
                .versions
                .insert((event.aggregate_id().clone(), event.aggregate_version()));
            tables.events.push(StoredRecord {
                sequence,
                record: EventRecord::from(event),
                recorded_at,
            });
        }

        Ok(())
    }
}

/// Staged writes of one unit of work against a [`MemoryDatabase`].
pub struct MemoryTransaction {
    database: MemoryDatabase,
    events: Vec<Event>,
    writes: Vec<DocumentWrite>,
}

impl MemoryTransaction {
    /// Stages an insert-or-replace of a document.
    ///
    /// Unique indexes are checked eagerly against committed data and earlier
    /// staged writes, and again at commit.
    pub async fn upsert_document(
        &mut self,
        collection: &str,
        id: &str,
        document: serde_json::Value,
    ) -> std::result::Result<(), UniqueViolation> {
        self.stage(DocumentWrite {
            collection: collection.to_string(),
            id: id.to_string(),
            document,
            monotonic: None,
        })
        .await
    }

    /// Like [`upsert_document`](Self::upsert_document), but never lowers the
    /// integer at `pointer` (e.g. `/version`): a write carrying a lower value
    /// than the committed document is skipped at commit.
    pub async fn upsert_document_monotonic(
        &mut self,
        collection: &str,
        id: &str,
        document: serde_json::Value,
        pointer: &str,
    ) -> std::result::Result<(), UniqueViolation> {
        self.stage(DocumentWrite {
            collection: collection.to_string(),
            id: id.to_string(),
            document,
            monotonic: Some(pointer.to_string()),
        })
        .await
    }

    async fn stage(&mut self, write: DocumentWrite) -> std::result::Result<(), UniqueViolation> {
        {
            let tables = self.database.tables.read().await;
            let mut pending = self.writes.clone();
            pending.push(write.clone());
            tables.stage_documents(&pending)?;
        }

        self.writes.push(write);
        Ok(())
    }

    /// Events staged by the unit of work.
    pub fn staged_events(&self) -> &[Event] {
        &self.events
    }

    /// Number of staged document writes.
    pub fn staged_document_count(&self) -> usize {
        self.writes.len()
    }

    /// Commits the staged document writes on their own, outside any event
    /// append.
    pub async fn commit_documents(mut self) -> std::result::Result<(), UniqueViolation> {
        self.events.clear();
        let database = self.database.clone();
        match database.commit(self).await {
            Err(CommitError::Document(violation)) => Err(violation),
            Err(CommitError::VersionConflict { .. }) | Ok(()) => Ok(()),
        }
    }
}

/// In-memory event store.
///
/// Provides the same guarantees as the PostgreSQL implementation: version
/// uniqueness per aggregate, atomic units of work shared with document
/// collections of the same [`MemoryDatabase`], and post-commit publication.
#[derive(Clone)]
pub struct InMemoryEventStore {
    database: MemoryDatabase,
    registry: Arc<EventRegistry>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl InMemoryEventStore {
    /// Creates a store over a fresh database.
    pub fn new(registry: EventRegistry) -> Self {
        Self::with_database(MemoryDatabase::new(), registry)
    }

    /// Creates a store over an existing database, so that hooks can write to
    /// its collections atomically with the events.
    pub fn with_database(database: MemoryDatabase, registry: EventRegistry) -> Self {
        Self {
            database,
            registry: Arc::new(registry),
            publisher: None,
        }
    }

    /// Sets the publisher that receives committed public events.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Returns the underlying database.
    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.database.event_count().await
    }

    fn to_stored(&self, stored: &StoredRecord) -> Result<StoredEvent> {
        Ok(StoredEvent {
            cursor: EventCursor::from_sequence(stored.sequence),
            event: self.registry.rehydrate(stored.record.clone())?,
            recorded_at: stored.recorded_at,
        })
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    type Transaction = MemoryTransaction;

    fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    #[tracing::instrument(skip_all, fields(%aggregate_id, events = unit.events().len()))]
    async fn commit_unit_of_work(
        &self,
        aggregate_id: &AggregateId,
        unit: UnitOfWork<'_, MemoryTransaction>,
    ) -> Result<()> {
        let started = Instant::now();
        let (events, side_effects) = unit.into_parts();

        validate_batch(aggregate_id, &events)?;
        for event in &events {
            self.registry.ensure_known(event)?;
        }

        let mut tx = self.database.begin();
        tx.events = events.clone();

        for hook in side_effects {
            hook.run(&mut tx).await.map_err(hook_failure)?;
        }

        match self.database.commit(tx).await {
            Ok(()) => {}
            Err(CommitError::VersionConflict {
                aggregate_id,
                version,
            }) => return Err(version_conflict(&aggregate_id, version)),
            Err(CommitError::Document(violation)) => {
                return Err(hook_failure(Box::new(violation)));
            }
        }

        metrics::counter!("event_store_events_appended_total").increment(events.len() as u64);
        metrics::histogram!("event_store_append_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::debug!("unit of work committed");

        publish_committed(self.publisher.as_ref(), &events).await;
        Ok(())
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<StoredEvent>> {
        let tables = self.database.tables.read().await;
        let mut records: Vec<_> = tables
            .events
            .iter()
            .filter(|stored| &stored.record.aggregate_id == aggregate_id)
            .collect();
        records.sort_by_key(|stored| stored.record.aggregate_version);
        records.into_iter().map(|stored| self.to_stored(stored)).collect()
    }

    async fn get_all_events(&self, query: EventFeedQuery) -> Result<Vec<StoredEvent>> {
        let tables = self.database.tables.read().await;
        tables
            .events
            .iter()
            .filter(|stored| {
                query.matches_name(&stored.record.event_name)
                    && query.matches_cursor(EventCursor::from_sequence(stored.sequence))
            })
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|stored| self.to_stored(stored))
            .collect()
    }

    async fn get_distinct_aggregate_ids(
        &self,
        event_names: Option<&[String]>,
        options: ScanOptions,
    ) -> Result<Vec<AggregateId>> {
        tracing::debug!(
            allow_large_scan = options.allow_large_scan,
            "scanning aggregate ids"
        );
        let tables = self.database.tables.read().await;
        let ids: BTreeSet<AggregateId> = tables
            .events
            .iter()
            .filter(|stored| {
                event_names.is_none_or(|names| names.contains(&stored.record.event_name))
            })
            .map(|stored| stored.record.aggregate_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}
