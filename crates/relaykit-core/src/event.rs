//! Domain event abstractions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DomainError;

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: String,
    /// Tenant that owns the aggregate.
    pub tenant_id: String,
    /// Contract identifier consumers validate the payload against.
    pub schema_id: Option<String>,
    /// Version of the payload contract.
    pub schema_version: i32,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Uuid,
    /// Causation ID linking this event to the event/command that caused it.
    pub causation_id: Uuid,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

impl EventMetadata {
    /// Creates metadata for a fresh event with a new v7 event id.
    #[must_use]
    pub fn new(
        aggregate_id: impl Into<String>,
        tenant_id: impl Into<String>,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate_id: aggregate_id.into(),
            tenant_id: tenant_id.into(),
            schema_id: None,
            schema_version: 1,
            correlation_id,
            causation_id: correlation_id,
            occurred_at: clock.now(),
        }
    }

    /// Sets the payload contract.
    #[must_use]
    pub fn with_schema(mut self, schema_id: impl Into<String>, schema_version: i32) -> Self {
        self.schema_id = Some(schema_id.into());
        self.schema_version = schema_version;
        self
    }

    /// Sets the causation ID.
    #[must_use]
    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = causation_id;
        self
    }
}

/// Trait that all typed domain events implement.
pub trait DomainEvent: Send + Sync + std::fmt::Debug {
    /// Returns the event type name (used for routing on the bus).
    fn event_type(&self) -> &'static str;

    /// Serializes the event payload to JSON.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    fn to_payload(&self) -> Result<serde_json::Value, DomainError>;

    /// Returns the metadata for this event.
    fn metadata(&self) -> &EventMetadata;

    /// Converts the event into its type-erased, hashable envelope.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    fn to_envelope(&self) -> Result<EventEnvelope, DomainError> {
        Ok(EventEnvelope::new(
            self.metadata().clone(),
            self.event_type(),
            self.to_payload()?,
        ))
    }
}

/// Serializable form of a domain event as it travels through the outbox and
/// onto the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event metadata.
    #[serde(flatten)]
    pub metadata: EventMetadata,
    /// Event type name.
    pub event_type: String,
    /// Event-specific payload.
    pub payload: serde_json::Value,
    /// Hex SHA-256 over the canonical JSON of every other field.
    pub content_hash: String,
}

impl EventEnvelope {
    /// Builds an envelope and derives its content hash.
    #[must_use]
    pub fn new(
        metadata: EventMetadata,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let event_type = event_type.into();
        let content_hash = content_hash(&metadata, &event_type, &payload);
        Self {
            metadata,
            event_type,
            payload,
            content_hash,
        }
    }

    /// Returns the event identifier.
    #[must_use]
    pub fn event_id(&self) -> Uuid {
        self.metadata.event_id
    }

    /// Recomputes the hash and compares it with the stored one.
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        content_hash(&self.metadata, &self.event_type, &self.payload) == self.content_hash
    }
}

/// Hashes the canonical JSON form of the event. `serde_json` maps are
/// ordered by key, so equal events always produce equal bytes.
fn content_hash(metadata: &EventMetadata, event_type: &str, payload: &serde_json::Value) -> String {
    let canonical = serde_json::json!({
        "metadata": metadata,
        "event_type": event_type,
        "payload": payload,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    struct Fixed(DateTime<Utc>);

    impl Clock for Fixed {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn metadata() -> EventMetadata {
        let clock = Fixed(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        EventMetadata::new("A-1", "tenant-1", Uuid::new_v4(), &clock)
    }

    #[test]
    fn test_envelope_hash_is_stable_for_equal_content() {
        // Arrange
        let meta = metadata();
        let a = EventEnvelope::new(meta.clone(), "order.placed", serde_json::json!({"b": 2, "a": 1}));
        let b = EventEnvelope::new(meta, "order.placed", serde_json::json!({"a": 1, "b": 2}));

        // Assert
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
        assert!(a.verify_hash());
    }

    #[test]
    fn test_envelope_hash_changes_with_payload() {
        let meta = metadata();
        let a = EventEnvelope::new(meta.clone(), "order.placed", serde_json::json!({"qty": 1}));
        let b = EventEnvelope::new(meta, "order.placed", serde_json::json!({"qty": 2}));

        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_tampered_envelope_fails_verification() {
        let mut envelope =
            EventEnvelope::new(metadata(), "order.placed", serde_json::json!({"qty": 1}));
        envelope.payload = serde_json::json!({"qty": 100});

        assert!(!envelope.verify_hash());
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = metadata().with_schema("orders/placed", 2);

        assert_eq!(meta.aggregate_id, "A-1");
        assert_eq!(meta.tenant_id, "tenant-1");
        assert_eq!(meta.schema_id.as_deref(), Some("orders/placed"));
        assert_eq!(meta.schema_version, 2);
        assert_eq!(meta.causation_id, meta.correlation_id);
    }

    #[test]
    fn test_envelope_serializes_flat_metadata() {
        let envelope = EventEnvelope::new(metadata(), "order.placed", serde_json::json!({}));
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["aggregate_id"], "A-1");
        assert_eq!(json["event_type"], "order.placed");
        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }
}
