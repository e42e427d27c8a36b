//! Outbox record and repository contract.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::EventEnvelope;

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    /// Written, not yet delivered.
    New,
    /// Delivered to the bus.
    Sent,
    /// Gave up after the retry budget; needs an operator.
    Err,
}

impl OutboxStatus {
    /// Column value for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Sent => "SENT",
            Self::Err => "ERR",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, DomainError> {
        match s {
            "NEW" => Ok(OutboxStatus::New),
            "SENT" => Ok(OutboxStatus::Sent),
            "ERR" => Ok(OutboxStatus::Err),
            other => Err(DomainError::Serialization(format!(
                "unknown outbox status: {other}"
            ))),
        }
    }
}

/// Durable relay unit: one row per domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Primary key, equal to the event id.
    pub id: Uuid,
    /// Tenant that owns the event.
    pub tenant_id: String,
    /// Aggregate the event belongs to.
    pub aggregate_id: Option<String>,
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Contract identifier.
    pub schema_id: Option<String>,
    /// Contract version.
    pub schema_version: i32,
    /// The serialized `EventEnvelope`.
    pub payload: serde_json::Value,
    /// Delivery status.
    pub status: OutboxStatus,
    /// Failed delivery attempts recorded by the relay.
    pub retry_cnt: i32,
    /// Most recent delivery error.
    pub last_error: Option<String>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
    /// When the row was delivered.
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Builds a `NEW` record for an event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the envelope cannot be encoded.
    pub fn from_envelope(
        envelope: &EventEnvelope,
        created_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let meta = &envelope.metadata;
        Ok(Self {
            id: meta.event_id,
            tenant_id: meta.tenant_id.clone(),
            aggregate_id: Some(meta.aggregate_id.clone()).filter(|id| !id.is_empty()),
            event_type: envelope.event_type.clone(),
            schema_id: meta.schema_id.clone(),
            schema_version: meta.schema_version,
            payload: serde_json::to_value(envelope)?,
            status: OutboxStatus::New,
            retry_cnt: 0,
            last_error: None,
            created_at,
            sent_at: None,
        })
    }

    /// Decodes the stored envelope.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload is not a valid
    /// envelope.
    pub fn envelope(&self) -> Result<EventEnvelope, DomainError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Persistence operations used by the relay and by operators.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Look up one row.
    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, DomainError>;

    /// Up to `limit` rows in `NEW` status, oldest `created_at` first.
    async fn fetch_new(&self, limit: u32) -> Result<Vec<OutboxRecord>, DomainError>;

    /// Transition `NEW` rows to `SENT`. Rows in any other status are left
    /// alone. Returns the number of rows updated.
    async fn mark_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> Result<u64, DomainError>;

    /// Record a failed delivery: increment `retry_cnt`, store the error, and
    /// move the row to `ERR` once `retry_cnt` exceeds `max_retries`. Returns
    /// the resulting status.
    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<OutboxStatus, DomainError>;

    /// Operator action: move an `ERR` row back to `NEW` with a fresh retry
    /// budget. Returns whether a row was requeued.
    async fn requeue(&self, id: Uuid) -> Result<bool, DomainError>;

    /// Delete `SENT` rows delivered before `before`. Returns the count.
    async fn purge_sent(&self, before: DateTime<Utc>) -> Result<u64, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::event::EventMetadata;

    #[test]
    fn test_from_envelope_copies_metadata_and_starts_new() {
        // Arrange
        let meta = EventMetadata::new("A-1", "tenant-1", Uuid::new_v4(), &SystemClock)
            .with_schema("orders/placed", 3);
        let envelope = EventEnvelope::new(meta, "order.placed", serde_json::json!({"qty": 1}));
        let now = Utc::now();

        // Act
        let record = OutboxRecord::from_envelope(&envelope, now).unwrap();

        // Assert
        assert_eq!(record.id, envelope.event_id());
        assert_eq!(record.tenant_id, "tenant-1");
        assert_eq!(record.aggregate_id.as_deref(), Some("A-1"));
        assert_eq!(record.event_type, "order.placed");
        assert_eq!(record.schema_id.as_deref(), Some("orders/placed"));
        assert_eq!(record.schema_version, 3);
        assert_eq!(record.status, OutboxStatus::New);
        assert_eq!(record.retry_cnt, 0);
        assert_eq!(record.created_at, now);
        assert_eq!(record.envelope().unwrap(), envelope);
    }

    #[test]
    fn test_status_round_trips_through_column_value() {
        for status in [OutboxStatus::New, OutboxStatus::Sent, OutboxStatus::Err] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("PENDING".parse::<OutboxStatus>().is_err());
    }
}
