//! `PostgreSQL` implementation of the `IdempotencyRepository` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use relaykit_core::error::DomainError;
use relaykit_core::idempotency::{IdempotencyRecord, IdempotencyRepository, IdempotencyState};

use crate::error::db_error;

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    idempotency_key: String,
    tenant_id: String,
    operation: String,
    request_hash: String,
    response: Option<serde_json::Value>,
    status_code: Option<i32>,
    state: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = DomainError;

    fn try_from(row: IdempotencyRow) -> Result<Self, DomainError> {
        let status_code = row
            .status_code
            .map(u16::try_from)
            .transpose()
            .map_err(|e| DomainError::Serialization(format!("stored status code out of range: {e}")))?;
        Ok(Self {
            idempotency_key: row.idempotency_key,
            tenant_id: row.tenant_id,
            operation: row.operation,
            request_hash: row.request_hash,
            response: row.response,
            status_code,
            state: row.state.parse()?,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

/// PostgreSQL-backed idempotency repository.
///
/// Every method is a single statement, so concurrent claims of the same key
/// are serialized by the primary key.
#[derive(Debug, Clone)]
pub struct PgIdempotencyRepository {
    pool: PgPool,
}

impl PgIdempotencyRepository {
    /// Creates a new `PgIdempotencyRepository`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyRepository for PgIdempotencyRepository {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<bool, DomainError> {
        let inserted = sqlx::query(
            "INSERT INTO idempotency_records \
             (idempotency_key, tenant_id, operation, request_hash, response, status_code, \
              state, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(&record.idempotency_key)
        .bind(&record.tenant_id)
        .bind(&record.operation)
        .bind(&record.request_hash)
        .bind(&record.response)
        .bind(record.status_code.map(i32::from))
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("claim idempotency key", e))?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, DomainError> {
        let row = sqlx::query_as::<_, IdempotencyRow>(
            "SELECT idempotency_key, tenant_id, operation, request_hash, response, status_code, \
             state, created_at, expires_at \
             FROM idempotency_records WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find idempotency record", e))?;
        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn reclaim(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        let updated = sqlx::query(
            "UPDATE idempotency_records SET tenant_id = $2, operation = $3, request_hash = $4, \
             response = NULL, status_code = NULL, state = $5, created_at = $6, expires_at = $7 \
             WHERE idempotency_key = $1 AND (state = 'FAILED' OR expires_at <= $8)",
        )
        .bind(&record.idempotency_key)
        .bind(&record.tenant_id)
        .bind(&record.operation)
        .bind(&record.request_hash)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("reclaim idempotency key", e))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn complete(
        &self,
        key: &str,
        response: &serde_json::Value,
        status_code: u16,
    ) -> Result<bool, DomainError> {
        let updated = sqlx::query(
            "UPDATE idempotency_records SET state = $2, response = $3, status_code = $4 \
             WHERE idempotency_key = $1 AND state = 'PENDING'",
        )
        .bind(key)
        .bind(IdempotencyState::Completed.as_str())
        .bind(response)
        .bind(i32::from(status_code))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("store idempotent response", e))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn fail(&self, key: &str) -> Result<bool, DomainError> {
        let updated = sqlx::query(
            "UPDATE idempotency_records SET state = $2 \
             WHERE idempotency_key = $1 AND state = 'PENDING'",
        )
        .bind(key)
        .bind(IdempotencyState::Failed.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark idempotency key failed", e))?;
        Ok(updated.rows_affected() == 1)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DomainError> {
        let deleted = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete expired idempotency records", e))?;
        Ok(deleted.rows_affected())
    }
}
