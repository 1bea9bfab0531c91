use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, Event, EventCursor, EventFeedQuery, EventId, EventRecord, EventRegistry,
    EventStoreConfig, EventStoreError, Result, ScanOptions, StoredEvent, Version,
    publisher::{EventPublisher, publish_committed},
    store::{EventStore, UnitOfWork, hook_failure, validate_batch, version_conflict},
};

const VERSION_CONSTRAINT: &str = "unique_aggregate_version";

/// PostgreSQL-backed event store implementation.
///
/// Every unit of work runs in one database transaction. Hooks receive that
/// transaction and may write any table through it.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    registry: Arc<EventRegistry>,
    publisher: Option<Arc<dyn EventPublisher>>,
    config: EventStoreConfig,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool, registry: EventRegistry) -> Self {
        Self {
            pool,
            registry: Arc::new(registry),
            publisher: None,
            config: EventStoreConfig::default(),
        }
    }

    /// Connects using the given settings.
    pub async fn connect(config: EventStoreConfig, registry: EventRegistry) -> Result<Self> {
        let pool = config.connect().await?;
        Ok(Self::new(pool, registry).with_config(config))
    }

    pub fn with_config(mut self, config: EventStoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the publisher that receives committed public events.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(&self, row: PgRow) -> Result<StoredEvent> {
        let record = EventRecord {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_id: AggregateId::new(row.try_get::<String, _>("aggregate_id")?),
            event_name: row.try_get("event_name")?,
            payload: row.try_get("payload")?,
            aggregate_version: Version::new(row.try_get("aggregate_version")?),
        };

        Ok(StoredEvent {
            cursor: EventCursor::from_sequence(row.try_get("sequence")?),
            event: self.registry.rehydrate(record)?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    async fn insert_event(tx: &mut Transaction<'static, Postgres>, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_store (event_id, aggregate_id, event_name, payload, aggregate_version)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.event_id().as_uuid())
        .bind(event.aggregate_id().as_str())
        .bind(event.event_name())
        .bind(event.payload())
        .bind(event.aggregate_version().as_i64())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some(VERSION_CONSTRAINT)
            {
                return version_conflict(event.aggregate_id(), event.aggregate_version());
            }
            EventStoreError::Database(e)
        })?;

        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    type Transaction = Transaction<'static, Postgres>;

    fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    #[tracing::instrument(skip_all, fields(%aggregate_id, events = unit.events().len()))]
    async fn commit_unit_of_work(
        &self,
        aggregate_id: &AggregateId,
        unit: UnitOfWork<'_, Self::Transaction>,
    ) -> Result<()> {
        let started = Instant::now();
        let (events, side_effects) = unit.into_parts();

        validate_batch(aggregate_id, &events)?;
        for event in &events {
            self.registry.ensure_known(event)?;
        }

        // Dropping the transaction on any early return rolls it back.
        let mut tx = self.pool.begin().await?;

        for event in &events {
            Self::insert_event(&mut tx, event).await?;
        }

        for hook in side_effects {
            hook.run(&mut tx).await.map_err(hook_failure)?;
        }

        tx.commit().await.map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some(VERSION_CONSTRAINT)
                && let Some(first) = events.first()
            {
                return version_conflict(aggregate_id, first.aggregate_version());
            }
            EventStoreError::Database(e)
        })?;

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
        let rows = sqlx::query(
            r#"
            SELECT sequence, event_id, aggregate_id, event_name, payload, aggregate_version, recorded_at
            FROM event_store
            WHERE aggregate_id = $1
            ORDER BY aggregate_version ASC
            "#,
        )
        .bind(aggregate_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_event(row)).collect()
    }

    async fn get_all_events(&self, query: EventFeedQuery) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, event_id, aggregate_id, event_name, payload, aggregate_version, recorded_at
            FROM event_store
            WHERE ($1::text[] IS NULL OR event_name = ANY($1))
              AND ($2::bigint IS NULL OR sequence > $2)
            ORDER BY sequence ASC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(query.event_names)
        .bind(query.after.map(|cursor| cursor.sequence()))
        .bind(i64::try_from(query.skip).unwrap_or(i64::MAX))
        .bind(query.limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_event(row)).collect()
    }

    async fn get_distinct_aggregate_ids(
        &self,
        event_names: Option<&[String]>,
        options: ScanOptions,
    ) -> Result<Vec<AggregateId>> {
        let mut tx = self.pool.begin().await?;

        if options.allow_large_scan {
            tracing::debug!(
                work_mem = %self.config.large_scan_work_mem,
                "raising work_mem for large scan"
            );
            sqlx::query("SELECT set_config('work_mem', $1, true)")
                .bind(&self.config.large_scan_work_mem)
                .execute(&mut *tx)
                .await?;
        }

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT aggregate_id
            FROM event_store
            WHERE ($1::text[] IS NULL OR event_name = ANY($1))
            GROUP BY aggregate_id
            ORDER BY aggregate_id COLLATE "C" ASC
            "#,
        )
        .bind(event_names.map(<[String]>::to_vec))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ids.into_iter().map(AggregateId::new).collect())
    }
}
