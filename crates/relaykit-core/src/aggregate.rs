//! Aggregate root abstraction and the pending-event buffer.

use uuid::Uuid;

use crate::error::DomainError;
use crate::event::{DomainEvent, EventEnvelope};

/// Trait for aggregate roots that emit domain events from behavior methods.
pub trait AggregateRoot: Send + Sync {
    /// The event type this aggregate produces.
    type Event: DomainEvent;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> &str;

    /// Returns the tenant that owns the aggregate.
    fn tenant_id(&self) -> &str;

    /// Returns the persisted version the aggregate was loaded at.
    fn version(&self) -> i64;

    /// Returns events produced by command handling and not yet collected.
    fn pending_events(&self) -> &[Self::Event];

    /// Removes and returns the pending events, oldest first.
    fn take_pending_events(&mut self) -> Vec<Self::Event>;
}

/// Ordered, in-memory list of events waiting for a commit.
///
/// The buffer is owned by exactly one unit of work. It never performs I/O.
#[derive(Debug, Default, Clone)]
pub struct EventBuffer {
    events: Vec<EventEnvelope>,
}

impl EventBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an event with this id is buffered.
    #[must_use]
    pub fn contains(&self, event_id: Uuid) -> bool {
        self.events.iter().any(|e| e.event_id() == event_id)
    }

    /// Appends an event unless one with the same id is already buffered.
    /// Returns whether the event was added.
    pub fn push(&mut self, event: EventEnvelope) -> bool {
        if self.contains(event.event_id()) {
            return false;
        }
        self.events.push(event);
        true
    }

    /// Drains an aggregate's pending events into the buffer and returns how
    /// many were added. Events already buffered are skipped.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if an event payload cannot be
    /// encoded. Nothing is collected in that case and the aggregate keeps
    /// all of its pending events.
    pub fn collect_from<A: AggregateRoot>(&mut self, aggregate: &mut A) -> Result<usize, DomainError> {
        let envelopes = aggregate
            .pending_events()
            .iter()
            .map(DomainEvent::to_envelope)
            .collect::<Result<Vec<_>, _>>()?;
        aggregate.take_pending_events();
        let mut added = 0;
        for envelope in envelopes {
            if self.push(envelope) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Returns the buffered events in insertion order.
    #[must_use]
    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Removes and returns all events.
    pub fn drain(&mut self) -> Vec<EventEnvelope> {
        std::mem::take(&mut self.events)
    }

    /// Discards all events.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::clock::SystemClock;
    use crate::event::EventMetadata;

    #[derive(Debug, Clone)]
    struct Renamed {
        metadata: EventMetadata,
        name: String,
    }

    impl DomainEvent for Renamed {
        fn event_type(&self) -> &'static str {
            "widget.renamed"
        }

        fn to_payload(&self) -> Result<serde_json::Value, DomainError> {
            if self.name.is_empty() {
                return Err(DomainError::Serialization("name must not be empty".into()));
            }
            Ok(serde_json::json!({ "name": self.name }))
        }

        fn metadata(&self) -> &EventMetadata {
            &self.metadata
        }
    }

    struct Widget {
        id: String,
        pending: Vec<Renamed>,
    }

    impl Widget {
        fn rename(&mut self, name: &str) {
            let metadata = EventMetadata::new(&*self.id, "tenant-1", Uuid::new_v4(), &SystemClock);
            self.pending.push(Renamed {
                metadata,
                name: name.to_owned(),
            });
        }
    }

    impl AggregateRoot for Widget {
        type Event = Renamed;

        fn aggregate_id(&self) -> &str {
            &self.id
        }

        fn tenant_id(&self) -> &str {
            "tenant-1"
        }

        fn version(&self) -> i64 {
            0
        }

        fn pending_events(&self) -> &[Renamed] {
            &self.pending
        }

        fn take_pending_events(&mut self) -> Vec<Renamed> {
            std::mem::take(&mut self.pending)
        }
    }

    #[test]
    fn test_collect_from_drains_aggregate_in_order() {
        // Arrange
        let mut widget = Widget {
            id: "W-1".into(),
            pending: Vec::new(),
        };
        widget.rename("first");
        widget.rename("second");
        let mut buffer = EventBuffer::new();

        // Act
        let collected = buffer.collect_from(&mut widget).unwrap();

        // Assert
        assert_eq!(collected, 2);
        assert!(widget.pending_events().is_empty());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.events()[0].payload["name"], "first");
        assert_eq!(buffer.events()[1].payload["name"], "second");
        assert_eq!(buffer.events()[0].metadata.aggregate_id, "W-1");
        assert!(buffer.events()[0].metadata.occurred_at <= Utc::now());
    }

    #[test]
    fn test_drain_empties_buffer() {
        let mut widget = Widget {
            id: "W-1".into(),
            pending: Vec::new(),
        };
        widget.rename("only");
        let mut buffer = EventBuffer::new();
        buffer.collect_from(&mut widget).unwrap();

        let drained = buffer.drain();

        assert_eq!(drained.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_failed_encoding_keeps_every_event_on_the_aggregate() {
        // Arrange
        let mut widget = Widget {
            id: "W-1".into(),
            pending: Vec::new(),
        };
        widget.rename("first");
        widget.rename("");
        widget.rename("third");
        let mut buffer = EventBuffer::new();

        // Act
        let result = buffer.collect_from(&mut widget);

        // Assert
        assert!(matches!(result, Err(DomainError::Serialization(_))));
        assert!(buffer.is_empty());
        assert_eq!(widget.pending_events().len(), 3);
    }

    #[test]
    fn test_collecting_an_already_buffered_event_is_skipped() {
        let mut widget = Widget {
            id: "W-1".into(),
            pending: Vec::new(),
        };
        widget.rename("once");
        let replay = widget.pending.clone();
        let mut buffer = EventBuffer::new();
        buffer.collect_from(&mut widget).unwrap();
        widget.pending = replay;

        let collected = buffer.collect_from(&mut widget).unwrap();

        assert_eq!(collected, 0);
        assert_eq!(buffer.len(), 1);
        assert!(widget.pending_events().is_empty());
    }
}
