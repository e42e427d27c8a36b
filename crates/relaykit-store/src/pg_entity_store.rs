//! `PostgreSQL` implementation of `EntityStore` and `TransactionalStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};

use relaykit_core::error::DomainError;
use relaykit_core::outbox::OutboxRecord;
use relaykit_core::repository::{
    ChangeSet, EntityRecord, EntityStore, EntityWrite, Query, TransactionalStore,
};

use crate::error::db_error;

#[derive(sqlx::FromRow)]
struct EntityRow {
    entity_type: String,
    id: String,
    version: i64,
    data: serde_json::Value,
}

impl From<EntityRow> for EntityRecord {
    fn from(row: EntityRow) -> Self {
        Self {
            entity_type: row.entity_type,
            id: row.id,
            version: row.version,
            data: row.data,
        }
    }
}

/// PostgreSQL-backed entity store.
///
/// Entities live in the `entities` document table. `apply` runs every staged
/// write and outbox row in one transaction; version checks are part of each
/// statement's `WHERE` clause.
#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    /// Creates a new `PgEntityStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn load(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>, DomainError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT entity_type, id, version, data FROM entities WHERE entity_type = $1 AND id = $2",
        )
        .bind(entity_type)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("load entity", e))?;
        Ok(row.map(EntityRecord::from))
    }

    async fn query(&self, entity_type: &str, query: &Query) -> Result<Vec<EntityRecord>, DomainError> {
        let filter = serde_json::Value::Object(query.filter.clone());
        let limit = query.limit.map(i64::from);
        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT entity_type, id, version, data FROM entities \
             WHERE entity_type = $1 AND data @> $2 \
             AND NOT EXISTS ( \
                 SELECT 1 FROM unnest($3::text[]) AS absent(field) \
                 WHERE coalesce(jsonb_typeof(data -> absent.field), 'null') <> 'null') \
             ORDER BY id LIMIT $4",
        )
        .bind(entity_type)
        .bind(filter)
        .bind(query.absent.as_slice())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("query entities", e))?;
        Ok(rows.into_iter().map(EntityRecord::from).collect())
    }
}

async fn current_version(
    tx: &mut Transaction<'_, Postgres>,
    entity_type: &str,
    id: &str,
) -> Result<Option<i64>, DomainError> {
    sqlx::query_scalar::<_, i64>("SELECT version FROM entities WHERE entity_type = $1 AND id = $2")
        .bind(entity_type)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| db_error("read entity version", e))
}

/// Explains a write that matched no row.
async fn rejected_write(
    tx: &mut Transaction<'_, Postgres>,
    entity_type: &str,
    id: &str,
    expected: i64,
) -> DomainError {
    match current_version(tx, entity_type, id).await {
        Ok(Some(actual)) => DomainError::ConcurrencyConflict {
            aggregate_id: id.to_owned(),
            expected,
            actual,
        },
        Ok(None) => DomainError::NotFound {
            entity_type: entity_type.to_owned(),
            id: id.to_owned(),
        },
        Err(e) => e,
    }
}

async fn apply_write(
    tx: &mut Transaction<'_, Postgres>,
    write: &EntityWrite,
    now: DateTime<Utc>,
) -> Result<(), DomainError> {
    match write {
        EntityWrite::Insert(record) => {
            let inserted = sqlx::query(
                "INSERT INTO entities (entity_type, id, version, data, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (entity_type, id) DO NOTHING",
            )
            .bind(&record.entity_type)
            .bind(&record.id)
            .bind(record.version)
            .bind(&record.data)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| db_error("insert entity", e))?;
            if inserted.rows_affected() == 0 {
                return Err(rejected_write(tx, &record.entity_type, &record.id, 0).await);
            }
        }
        EntityWrite::Update {
            record,
            expected_version,
        } => {
            let updated = sqlx::query(
                "UPDATE entities SET version = $3, data = $4, updated_at = $5 \
                 WHERE entity_type = $1 AND id = $2 AND version = $6",
            )
            .bind(&record.entity_type)
            .bind(&record.id)
            .bind(record.version)
            .bind(&record.data)
            .bind(now)
            .bind(expected_version)
            .execute(&mut **tx)
            .await
            .map_err(|e| db_error("update entity", e))?;
            if updated.rows_affected() == 0 {
                return Err(
                    rejected_write(tx, &record.entity_type, &record.id, *expected_version).await,
                );
            }
        }
        EntityWrite::Delete {
            entity_type,
            id,
            expected_version,
        } => {
            let deleted = sqlx::query(
                "DELETE FROM entities \
                 WHERE entity_type = $1 AND id = $2 AND ($3::BIGINT IS NULL OR version = $3)",
            )
            .bind(entity_type)
            .bind(id)
            .bind(expected_version)
            .execute(&mut **tx)
            .await
            .map_err(|e| db_error("delete entity", e))?;
            if deleted.rows_affected() == 0 {
                return Err(
                    rejected_write(tx, entity_type, id, expected_version.unwrap_or_default()).await,
                );
            }
        }
    }
    Ok(())
}

/// Inserts an outbox row; a row with the same id is left untouched.
pub(crate) async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    record: &OutboxRecord,
) -> Result<bool, DomainError> {
    let inserted = sqlx::query(
        "INSERT INTO outbox \
         (id, tenant_id, aggregate_id, type, schema_id, schema_version, payload, \
          status, retry_cnt, last_error, created_at, sent_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(record.id)
    .bind(&record.tenant_id)
    .bind(&record.aggregate_id)
    .bind(&record.event_type)
    .bind(&record.schema_id)
    .bind(record.schema_version)
    .bind(&record.payload)
    .bind(record.status.as_str())
    .bind(record.retry_cnt)
    .bind(&record.last_error)
    .bind(record.created_at)
    .bind(record.sent_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| db_error("insert outbox row", e))?;
    Ok(inserted.rows_affected() == 1)
}

#[async_trait]
impl TransactionalStore for PgEntityStore {
    #[instrument(skip_all, fields(writes = change_set.writes().len(), outbox = change_set.outbox().len()))]
    async fn apply(&self, change_set: &ChangeSet) -> Result<(), DomainError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;
        let now = Utc::now();

        for write in change_set.writes() {
            apply_write(&mut tx, write, now).await?;
        }
        for record in change_set.outbox() {
            if !insert_outbox(&mut tx, record).await? {
                debug!(event_id = %record.id, "outbox row already present");
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))
    }
}
