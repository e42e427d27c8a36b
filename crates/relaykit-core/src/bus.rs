//! Message bus abstraction.

use async_trait::async_trait;

use crate::error::DomainError;
use crate::event::EventEnvelope;

/// Publishes events to external consumers.
///
/// Delivery is at-least-once: consumers deduplicate on `event_id`.
/// Implementations return `DomainError::Publish` on transient delivery
/// failure so callers can retry.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a batch of events in order.
    async fn publish(&self, events: &[EventEnvelope]) -> Result<(), DomainError>;

    /// Publish a single event.
    async fn publish_one(&self, event: &EventEnvelope) -> Result<(), DomainError> {
        self.publish(std::slice::from_ref(event)).await
    }
}
