//! Test buses: mock `MessageBus` implementations for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use relaykit_core::bus::MessageBus;
use relaykit_core::error::DomainError;
use relaykit_core::event::EventEnvelope;
use uuid::Uuid;

/// A bus that records every published event and always succeeds.
#[derive(Debug, Default)]
pub struct RecordingBus {
    published: Mutex<Vec<EventEnvelope>>,
    calls: AtomicUsize,
}

impl RecordingBus {
    /// Create an empty recording bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all published events, in publish order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.published.lock().unwrap().clone()
    }

    /// Returns the ids of all published events, in publish order.
    pub fn published_ids(&self) -> Vec<Uuid> {
        self.published().iter().map(EventEnvelope::event_id).collect()
    }

    /// Number of `publish` calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, events: &[EventEnvelope]) -> Result<(), DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.published.lock().unwrap().extend_from_slice(events);
        Ok(())
    }
}

/// A bus that always fails with a transient publish error. Useful for
/// testing retry and dead-letter paths.
#[derive(Debug, Default)]
pub struct FailingBus {
    calls: AtomicUsize,
}

impl FailingBus {
    /// Create a failing bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `publish` calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for FailingBus {
    async fn publish(&self, _events: &[EventEnvelope]) -> Result<(), DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DomainError::Publish("broker unavailable".into()))
    }
}

/// A bus that fails the first `failures` calls, then records and succeeds.
#[derive(Debug)]
pub struct FlakyBus {
    remaining_failures: AtomicUsize,
    inner: RecordingBus,
}

impl FlakyBus {
    /// Create a bus that fails `failures` times before succeeding.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            inner: RecordingBus::new(),
        }
    }

    /// Events delivered after the failures ran out.
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.inner.published()
    }

    /// Number of `publish` calls, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

#[async_trait]
impl MessageBus for FlakyBus {
    async fn publish(&self, events: &[EventEnvelope]) -> Result<(), DomainError> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            return Err(DomainError::Publish("connection reset by broker".into()));
        }
        self.inner.publish(events).await
    }
}
