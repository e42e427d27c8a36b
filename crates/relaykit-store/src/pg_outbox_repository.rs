//! `PostgreSQL` implementation of the `OutboxRepository` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use relaykit_core::error::DomainError;
use relaykit_core::outbox::{OutboxRecord, OutboxRepository, OutboxStatus};

use crate::error::db_error;

const OUTBOX_COLUMNS: &str = "id, tenant_id, aggregate_id, type AS event_type, schema_id, \
     schema_version, payload, status, retry_cnt, last_error, created_at, sent_at";

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    tenant_id: String,
    aggregate_id: Option<String>,
    event_type: String,
    schema_id: Option<String>,
    schema_version: i32,
    payload: serde_json::Value,
    status: String,
    retry_cnt: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = DomainError;

    fn try_from(row: OutboxRow) -> Result<Self, DomainError> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            schema_id: row.schema_id,
            schema_version: row.schema_version,
            payload: row.payload,
            status: row.status.parse()?,
            retry_cnt: row.retry_cnt,
            last_error: row.last_error,
            created_at: row.created_at,
            sent_at: row.sent_at,
        })
    }
}

/// PostgreSQL-backed outbox repository.
#[derive(Debug, Clone)]
pub struct PgOutboxRepository {
    pool: PgPool,
}

impl PgOutboxRepository {
    /// Creates a new `PgOutboxRepository`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, DomainError> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find outbox row", e))?;
        row.map(OutboxRecord::try_from).transpose()
    }

    async fn fetch_new(&self, limit: u32) -> Result<Vec<OutboxRecord>, DomainError> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'NEW' \
             ORDER BY created_at, seq LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("fetch new outbox rows", e))?;
        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    async fn mark_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> Result<u64, DomainError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'SENT', sent_at = $2 \
             WHERE id = ANY($1) AND status = 'NEW'",
        )
        .bind(ids)
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark outbox rows sent", e))?;
        Ok(updated.rows_affected())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<OutboxStatus, DomainError> {
        let status = sqlx::query_scalar::<_, String>(
            "UPDATE outbox SET retry_cnt = retry_cnt + 1, last_error = $2, \
             status = CASE WHEN retry_cnt + 1 > $3 THEN 'ERR' ELSE status END \
             WHERE id = $1 AND status = 'NEW' \
             RETURNING status",
        )
        .bind(id)
        .bind(error)
        .bind(max_retries)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("record outbox failure", e))?;

        match status {
            Some(status) => status.parse(),
            None => match self.find(id).await? {
                Some(row) => Ok(row.status),
                None => Err(DomainError::NotFound {
                    entity_type: "OutboxRecord".into(),
                    id: id.to_string(),
                }),
            },
        }
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, DomainError> {
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'NEW', retry_cnt = 0 WHERE id = $1 AND status = 'ERR'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("requeue outbox row", e))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn purge_sent(&self, before: DateTime<Utc>) -> Result<u64, DomainError> {
        let deleted = sqlx::query("DELETE FROM outbox WHERE status = 'SENT' AND sent_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("purge sent outbox rows", e))?;
        Ok(deleted.rows_affected())
    }
}
