use std::marker::PhantomData;

use async_trait::async_trait;
use event_store::{MemoryDatabase, MemoryTransaction};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::SnapshotError;
use crate::filter::{FindOptions, SnapshotFilter, compare_documents};
use crate::snapshot::CurrentSnapshot;
use crate::store::{SnapshotResult, SnapshotStore};

/// Snapshot cache stored as a document collection of a [`MemoryDatabase`].
///
/// Share the database with an `InMemoryEventStore` to get atomic
/// commit-and-save.
pub struct InMemorySnapshotStore<S> {
    database: MemoryDatabase,
    collection: String,
    _state: PhantomData<fn() -> S>,
}

impl<S> InMemorySnapshotStore<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates a store over the `{aggregate_type}_current_snapshot`
    /// collection.
    pub fn new(database: MemoryDatabase, aggregate_type: &str) -> Self {
        Self {
            database,
            collection: format!("{aggregate_type}_current_snapshot"),
            _state: PhantomData,
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    /// Enforces uniqueness of a state field across snapshots. Null or
    /// missing values are not indexed.
    pub async fn create_unique_index(&self, field: &str) -> SnapshotResult<()> {
        let pointer = format!("/state/{}", field.replace('.', "/"));
        self.database
            .create_unique_index(&self.collection, pointer)
            .await?;
        Ok(())
    }

    /// Removes every snapshot.
    pub async fn clear(&self) {
        self.database.clear_collection(&self.collection).await;
    }

    /// Single read path: filter, sort, page.
    async fn select(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> Vec<serde_json::Value> {
        let sort = options.effective_sort();
        let mut documents: Vec<_> = self
            .database
            .documents(&self.collection)
            .await
            .into_iter()
            .filter(|document| filter.matches(document))
            .collect();
        documents.sort_by(|a, b| compare_documents(a, b, &sort));

        documents
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect()
    }

    fn decode(document: serde_json::Value) -> SnapshotResult<CurrentSnapshot<S>> {
        Ok(serde_json::from_value(document)?)
    }
}

impl<S> Clone for InMemorySnapshotStore<S> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            collection: self.collection.clone(),
            _state: PhantomData,
        }
    }
}

#[async_trait]
impl<S> SnapshotStore for InMemorySnapshotStore<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type State = S;
    type Transaction = MemoryTransaction;

    fn collection(&self) -> &str {
        &self.collection
    }

    /// Writes nothing when the stored snapshot has a higher version.
    #[tracing::instrument(skip_all, fields(collection = %self.collection, id = %snapshot.id))]
    async fn save(
        &self,
        tx: &mut MemoryTransaction,
        snapshot: &CurrentSnapshot<S>,
    ) -> SnapshotResult<()> {
        let document = serde_json::to_value(snapshot)?;
        tx.upsert_document_monotonic(&self.collection, snapshot.id.as_str(), document, "/version")
            .await
            .map_err(SnapshotError::from)
    }

    async fn save_standalone(&self, snapshot: &CurrentSnapshot<S>) -> SnapshotResult<()> {
        let mut tx = self.database.begin();
        self.save(&mut tx, snapshot).await?;
        tx.commit_documents().await?;
        Ok(())
    }

    async fn find_one(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> SnapshotResult<Option<CurrentSnapshot<S>>> {
        let options = options.clone().limit(1);
        self.select(filter, &options)
            .await
            .into_iter()
            .next()
            .map(Self::decode)
            .transpose()
    }

    async fn find_many(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> SnapshotResult<Vec<CurrentSnapshot<S>>> {
        self.select(filter, options)
            .await
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    async fn count(&self, filter: &SnapshotFilter) -> SnapshotResult<u64> {
        Ok(self.select(filter, &FindOptions::default()).await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::AggregateId;
    use event_store::Version;
    use serde::Deserialize;

    use super::*;
    use crate::filter::{SortKey, SortOrder};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        email: Option<String>,
        age: u32,
    }

    fn snapshot(id: &str, email: Option<&str>, age: u32, deleted: bool) -> CurrentSnapshot<Profile> {
        CurrentSnapshot {
            id: AggregateId::new(id),
            version: Version::first(),
            deleted,
            state: Profile {
                email: email.map(str::to_string),
                age,
            },
            updated_at: Utc::now(),
        }
    }

    async fn seeded() -> InMemorySnapshotStore<Profile> {
        let store = InMemorySnapshotStore::new(MemoryDatabase::new(), "Profile");
        for s in [
            snapshot("c", Some("c@example.com"), 30, false),
            snapshot("a", Some("a@example.com"), 40, false),
            snapshot("b", None, 30, true),
            snapshot("d", None, 20, false),
        ] {
            store.save_standalone(&s).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn collection_is_named_after_aggregate_type() {
        let store: InMemorySnapshotStore<Profile> =
            InMemorySnapshotStore::new(MemoryDatabase::new(), "Profile");
        assert_eq!(store.collection(), "Profile_current_snapshot");
    }

    #[tokio::test]
    async fn save_upserts_by_id() {
        let store = seeded().await;
        let mut updated = snapshot("a", Some("a@example.com"), 41, false);
        updated.version = Version::new(2);

        store.save_standalone(&updated).await.unwrap();

        let found = store
            .find_one(&SnapshotFilter::by_id("a"), &FindOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.version, Version::new(2));
        assert_eq!(found.state.age, 41);
        assert_eq!(store.count(&SnapshotFilter::new().include_deleted()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn older_version_does_not_overwrite() {
        let store = seeded().await;
        let mut newer = snapshot("a", Some("a@example.com"), 42, false);
        newer.version = Version::new(3);
        store.save_standalone(&newer).await.unwrap();

        let mut stale = snapshot("a", Some("a@example.com"), 41, false);
        stale.version = Version::new(2);
        store.save_standalone(&stale).await.unwrap();

        let found = store
            .find_one(&SnapshotFilter::by_id("a"), &FindOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.version, Version::new(3));
        assert_eq!(found.state.age, 42);
    }

    #[tokio::test]
    async fn every_read_path_hides_deleted_by_default() {
        let store = seeded().await;

        assert_eq!(store.count(&SnapshotFilter::new()).await.unwrap(), 3);
        assert!(
            store
                .find_one(&SnapshotFilter::by_id("b"), &FindOptions::default())
                .await
                .unwrap()
                .is_none()
        );
        let ids: Vec<_> = store
            .find_many(&SnapshotFilter::new(), &FindOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "c", "d"]);

        assert_eq!(
            store
                .count(&SnapshotFilter::new().only_deleted())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn state_filter_sort_and_paging() {
        let store = seeded().await;

        let thirty = store
            .find_many(
                &SnapshotFilter::new().state_eq("age", 30).include_deleted(),
                &FindOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(thirty.len(), 2);

        let page: Vec<_> = store
            .find_many(
                &SnapshotFilter::new(),
                &FindOptions::new()
                    .sort_by(SortKey::Field("age".into()), SortOrder::Descending)
                    .skip(1)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, AggregateId::new("c"));
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let store = seeded().await;
        store.create_unique_index("email").await.unwrap();

        let result = store
            .save_standalone(&snapshot("e", Some("a@example.com"), 50, false))
            .await;

        assert!(matches!(result, Err(SnapshotError::UniqueViolation { .. })));
        assert_eq!(store.count(&SnapshotFilter::new()).await.unwrap(), 3);

        store
            .save_standalone(&snapshot("f", None, 50, false))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let store = seeded().await;
        store.clear().await;
        assert_eq!(
            store
                .count(&SnapshotFilter::new().include_deleted())
                .await
                .unwrap(),
            0
        );
    }
}
