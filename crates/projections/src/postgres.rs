use std::marker::PhantomData;

use async_trait::async_trait;
use common::AggregateId;
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction, postgres::PgRow};

use crate::error::SnapshotError;
use crate::filter::{FindOptions, SnapshotFilter, SortKey, SortOrder};
use crate::snapshot::CurrentSnapshot;
use crate::store::{SnapshotResult, SnapshotStore};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Snapshot cache stored in a PostgreSQL table.
///
/// Writes run on the event store's transaction, so a snapshot commits or
/// rolls back with the events it reflects. The table is named
/// `{aggregate_type}_current_snapshot`, lowercased.
pub struct PostgresSnapshotStore<S> {
    pool: PgPool,
    table: String,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for PostgresSnapshotStore<S> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            table: self.table.clone(),
            _state: PhantomData,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    name.len() <= MAX_IDENTIFIER_LEN
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn field_segments(field: &str) -> SnapshotResult<Vec<String>> {
    field
        .split('.')
        .map(|segment| {
            if !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                Ok(segment.to_string())
            } else {
                Err(SnapshotError::InvalidCollectionName(field.to_string()))
            }
        })
        .collect()
}

impl<S> PostgresSnapshotStore<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates a store for `aggregate_type`. The derived table name must be a
    /// plain lowercase identifier.
    pub fn new(pool: PgPool, aggregate_type: &str) -> SnapshotResult<Self> {
        let table = format!("{}_current_snapshot", aggregate_type.to_ascii_lowercase());
        if !is_identifier(&table) {
            return Err(SnapshotError::InvalidCollectionName(table));
        }
        Ok(Self {
            pool,
            table,
            _state: PhantomData,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the snapshot table and its containment index if missing.
    pub async fn create_table(&self) -> SnapshotResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                version BIGINT NOT NULL,
                deleted BOOLEAN NOT NULL DEFAULT FALSE,
                state JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            table = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_state_idx ON {table} USING GIN (state jsonb_path_ops)",
            table = self.table
        ))
        .execute(&self.pool)
        .await?;

        tracing::debug!(table = %self.table, "snapshot table ready");
        Ok(())
    }

    /// Enforces uniqueness of a state field across snapshots. Null or
    /// missing values are not indexed.
    pub async fn create_unique_index(&self, field: &str) -> SnapshotResult<()> {
        let segments = field_segments(field)?;
        let index = format!("{}_{}_unique", self.table, segments.join("_").to_ascii_lowercase());
        if !is_identifier(&index) {
            return Err(SnapshotError::InvalidCollectionName(index));
        }

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table} ((state #>> '{{{path}}}'))",
            table = self.table,
            path = segments.join(","),
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| self.map_unique_violation(e))?;
        Ok(())
    }

    /// Removes every snapshot.
    pub async fn clear(&self) -> SnapshotResult<()> {
        sqlx::query(&format!("TRUNCATE {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn map_unique_violation(&self, error: sqlx::Error) -> SnapshotError {
        if let sqlx::Error::Database(ref db_err) = error
            && db_err.is_unique_violation()
        {
            return SnapshotError::UniqueViolation {
                collection: self.table.clone(),
                index: db_err.constraint().unwrap_or_default().to_string(),
            };
        }
        SnapshotError::Database(error)
    }

    fn push_filter(&self, builder: &mut QueryBuilder<'_, Postgres>, filter: &SnapshotFilter) {
        builder
            .push(" WHERE state @> ")
            .push_bind(filter.state_pattern())
            .push("::jsonb");
        if let Some(id) = &filter.id {
            builder.push(" AND id = ").push_bind(id.as_str().to_owned());
        }
        if let Some(deleted) = filter.deleted.required_flag() {
            builder.push(" AND deleted = ").push_bind(deleted);
        }
    }

    fn push_order(builder: &mut QueryBuilder<'_, Postgres>, options: &FindOptions) {
        builder.push(" ORDER BY ");
        let mut keys = builder.separated(", ");
        for (key, order) in options.effective_sort() {
            match key {
                SortKey::Id => keys.push(r#"id COLLATE "C""#),
                SortKey::Version => keys.push("version"),
                SortKey::UpdatedAt => keys.push("updated_at"),
                SortKey::Field(field) => keys
                    .push("state #> ")
                    .push_bind_unseparated(
                        field.split('.').map(str::to_string).collect::<Vec<_>>(),
                    )
                    .push_unseparated("::text[]"),
            };
            keys.push_unseparated(match order {
                SortOrder::Ascending => " ASC",
                SortOrder::Descending => " DESC",
            });
        }

        builder
            .push(" OFFSET ")
            .push_bind(i64::try_from(options.skip).unwrap_or(i64::MAX));
        if let Some(limit) = options.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
    }

    async fn select(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> SnapshotResult<Vec<CurrentSnapshot<S>>> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT id, version, deleted, state, updated_at FROM {}",
            self.table
        ));
        self.push_filter(&mut builder, filter);
        Self::push_order(&mut builder, options);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_snapshot).collect()
    }

    fn row_to_snapshot(row: PgRow) -> SnapshotResult<CurrentSnapshot<S>> {
        Ok(CurrentSnapshot {
            id: AggregateId::new(row.try_get::<String, _>("id")?),
            version: Version::new(row.try_get("version")?),
            deleted: row.try_get("deleted")?,
            state: serde_json::from_value(row.try_get("state")?)?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl<S> SnapshotStore for PostgresSnapshotStore<S>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type State = S;
    type Transaction = Transaction<'static, Postgres>;

    fn collection(&self) -> &str {
        &self.table
    }

    /// Leaves the row untouched when it already has a higher version.
    #[tracing::instrument(skip_all, fields(table = %self.table, id = %snapshot.id))]
    async fn save(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        snapshot: &CurrentSnapshot<S>,
    ) -> SnapshotResult<()> {
        let state = serde_json::to_value(&snapshot.state)?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, version, deleted, state, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                version = EXCLUDED.version,
                deleted = EXCLUDED.deleted,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            WHERE {table}.version <= EXCLUDED.version
            "#,
            table = self.table
        ))
        .bind(snapshot.id.as_str())
        .bind(snapshot.version.as_i64())
        .bind(snapshot.deleted)
        .bind(state)
        .bind(snapshot.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| self.map_unique_violation(e))?;

        Ok(())
    }

    async fn save_standalone(&self, snapshot: &CurrentSnapshot<S>) -> SnapshotResult<()> {
        let mut tx = self.pool.begin().await?;
        self.save(&mut tx, snapshot).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_one(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> SnapshotResult<Option<CurrentSnapshot<S>>> {
        let options = options.clone().limit(1);
        Ok(self.select(filter, &options).await?.into_iter().next())
    }

    async fn find_many(
        &self,
        filter: &SnapshotFilter,
        options: &FindOptions,
    ) -> SnapshotResult<Vec<CurrentSnapshot<S>>> {
        self.select(filter, options).await
    }

    async fn count(&self, filter: &SnapshotFilter) -> SnapshotResult<u64> {
        let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", self.table));
        self.push_filter(&mut builder, filter);

        let count: i64 = builder.build().fetch_one(&self.pool).await?.try_get(0)?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_plain_lowercase() {
        assert!(is_identifier("testaggregate_current_snapshot"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("drop table; --"));
        assert!(!is_identifier(""));
        assert!(!is_identifier(&"a".repeat(64)));
    }

    #[test]
    fn field_paths_are_validated() {
        assert_eq!(
            field_segments("address.city").unwrap(),
            vec!["address".to_string(), "city".to_string()]
        );
        assert!(field_segments("a..b").is_err());
        assert!(field_segments("x'); DROP").is_err());
    }
}
