//! Periodic cleanup: expired idempotency keys and old `SENT` outbox rows.

use std::sync::Arc;
use std::time::Duration;

use relaykit_core::clock::{self, Clock, SystemClock};
use relaykit_core::error::DomainError;
use relaykit_idempotency::IdempotencyStore;
use relaykit_outbox::OutboxProjector;
use tokio::sync::watch;
use tracing::{info, warn};

/// Counts removed by one housekeeping pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HousekeepingPass {
    /// Idempotency records deleted.
    pub expired_keys: u64,
    /// Outbox rows deleted.
    pub purged_rows: u64,
}

/// Runs cleanup on an interval until stopped.
pub struct Housekeeper {
    idempotency: Arc<IdempotencyStore>,
    projector: Arc<OutboxProjector>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    sent_retention: Duration,
}

impl std::fmt::Debug for Housekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Housekeeper")
            .field("interval", &self.interval)
            .field("sent_retention", &self.sent_retention)
            .finish_non_exhaustive()
    }
}

impl Housekeeper {
    /// Creates a housekeeper on the system clock.
    #[must_use]
    pub fn new(
        idempotency: Arc<IdempotencyStore>,
        projector: Arc<OutboxProjector>,
        interval: Duration,
        sent_retention: Duration,
    ) -> Self {
        Self {
            idempotency,
            projector,
            clock: Arc::new(SystemClock),
            interval,
            sent_retention,
        }
    }

    /// Replaces the clock used for the retention cutoff.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deletes expired idempotency records and `SENT` rows older than the
    /// retention window.
    ///
    /// # Errors
    ///
    /// Returns repository errors; a failed step does not skip the other.
    pub async fn run_once(&self) -> Result<HousekeepingPass, DomainError> {
        let cutoff = self.clock.now() - clock::span(self.sent_retention)?;

        let expired = self.idempotency.cleanup_expired().await;
        let purged = self.projector.purge_sent(cutoff).await;
        Ok(HousekeepingPass {
            expired_keys: expired?,
            purged_rows: purged?,
        })
    }

    /// Runs a pass every `interval` until `stop` turns true.
    pub async fn run_until(&self, mut stop: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "housekeeping started");
        while !*stop.borrow() {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                _ = stop.changed() => continue,
            }
            if let Err(err) = self.run_once().await {
                warn!(error = %err, reason_code = err.reason_code(), "housekeeping pass failed");
            }
        }
        info!("housekeeping stopped");
    }
}
