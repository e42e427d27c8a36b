//! Idempotency record and repository contract.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdempotencyState {
    /// Claimed; the operation is running.
    Pending,
    /// Finished; the stored response is replayed on retry.
    Completed,
    /// Failed; the key may be claimed again.
    Failed,
}

impl IdempotencyState {
    /// Column value for this state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IdempotencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(DomainError::Serialization(format!(
                "unknown idempotency state: {other}"
            ))),
        }
    }
}

/// A claimed idempotency key and, once finished, its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Client-supplied key; primary key.
    pub idempotency_key: String,
    /// Tenant that issued the request.
    pub tenant_id: String,
    /// Logical operation name.
    pub operation: String,
    /// Hash of the request payload the key was first used with.
    pub request_hash: String,
    /// Stored response body, once completed.
    pub response: Option<serde_json::Value>,
    /// Stored response status, once completed.
    pub status_code: Option<u16>,
    /// Lifecycle state.
    pub state: IdempotencyState,
    /// When the key was claimed.
    pub created_at: DateTime<Utc>,
    /// When the record stops counting.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Whether the record has outlived its TTL at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage primitives the idempotency store composes. Each call must be
/// atomic with respect to concurrent callers using the same key.
#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Insert `record` unless a record with its key exists. Returns whether
    /// it was inserted.
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<bool, DomainError>;

    /// Look up a record.
    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, DomainError>;

    /// Overwrite the existing record with `record` only if the existing one
    /// is `FAILED` or expired at `now`. Returns whether it was overwritten.
    async fn reclaim(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError>;

    /// `PENDING` → `COMPLETED` with a response. Returns whether a pending
    /// record was updated.
    async fn complete(
        &self,
        key: &str,
        response: &serde_json::Value,
        status_code: u16,
    ) -> Result<bool, DomainError>;

    /// `PENDING` → `FAILED`. Returns whether a pending record was updated.
    async fn fail(&self, key: &str) -> Result<bool, DomainError>;

    /// Delete records expired at `now`. Returns the count.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DomainError>;
}
