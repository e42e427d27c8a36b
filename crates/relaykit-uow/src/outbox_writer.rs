//! Transactional outbox writer.
//!
//! Runs as the before-commit hook of a unit of work. It only touches the
//! in-memory change set, so it never suspends inside the commit critical
//! section.

use chrono::{DateTime, Utc};
use relaykit_core::error::DomainError;
use relaykit_core::event::EventEnvelope;
use relaykit_core::outbox::OutboxRecord;
use relaykit_core::repository::ChangeSet;
use tracing::debug;

/// Stages one `NEW` outbox record per buffered event.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxWriter;

impl OutboxWriter {
    /// Creates a writer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Stages outbox records for `events` in buffer order, skipping events
    /// whose id is already staged. Returns the number of records added.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if an event cannot be encoded;
    /// nothing is staged in that case.
    pub fn before_commit(
        &self,
        change_set: &mut ChangeSet,
        events: &[EventEnvelope],
        now: DateTime<Utc>,
    ) -> Result<usize, DomainError> {
        let records = events
            .iter()
            .map(|event| OutboxRecord::from_envelope(event, now))
            .collect::<Result<Vec<_>, _>>()?;

        let mut staged = 0;
        for record in records {
            let id = record.id;
            if change_set.stage_outbox(record) {
                staged += 1;
            } else {
                debug!(event_id = %id, "outbox record already staged, skipping");
            }
        }
        Ok(staged)
    }
}
