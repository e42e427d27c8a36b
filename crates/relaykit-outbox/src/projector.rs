//! Outbox projector: polls `NEW` outbox rows and publishes them.
//!
//! Per row: `NEW → SENT` on success. On failure `retry_cnt` is incremented
//! and the row stays `NEW` until `retry_cnt` exceeds `max_retries`, at which
//! point it becomes `ERR` and waits for an operator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relaykit_core::bus::MessageBus;
use relaykit_core::clock::{Clock, SystemClock};
use relaykit_core::error::DomainError;
use relaykit_core::outbox::{OutboxRecord, OutboxRepository, OutboxStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Projector settings.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Sleep between polls that found less than a full batch.
    pub poll_interval: Duration,
    /// Rows fetched per poll.
    pub batch_size: u32,
    /// Failures tolerated before a row is dead-lettered.
    pub max_retries: i32,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_retries: 5,
        }
    }
}

impl ProjectorConfig {
    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the retry limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(0);
        self
    }
}

/// Summary of one projector pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionPass {
    /// Rows fetched.
    pub fetched: usize,
    /// Rows published and marked `SENT`.
    pub sent: usize,
    /// Rows that failed and stay `NEW`.
    pub retried: usize,
    /// Rows that failed and became `ERR`.
    pub dead_lettered: usize,
}

/// Publishes outbox rows until stopped.
pub struct OutboxProjector {
    outbox: Arc<dyn OutboxRepository>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    config: ProjectorConfig,
    stop_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for OutboxProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProjector")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl OutboxProjector {
    /// Creates a projector using the system clock.
    #[must_use]
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        bus: Arc<dyn MessageBus>,
        config: ProjectorConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            outbox,
            bus,
            clock: Arc::new(SystemClock),
            config,
            stop_tx,
        }
    }

    /// Replaces the clock used for `sent_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    async fn relay(&self, row: &OutboxRecord) -> Result<(), DomainError> {
        let envelope = row.envelope()?;
        self.bus.publish_one(&envelope).await
    }

    /// Publishes up to `batch_size` `NEW` rows, oldest first, and records
    /// each outcome.
    ///
    /// # Errors
    ///
    /// Returns outbox repository errors. Publish errors are recorded on the
    /// row, not returned.
    #[instrument(skip(self), fields(batch_size = self.config.batch_size))]
    pub async fn run_once(&self) -> Result<ProjectionPass, DomainError> {
        let rows = self.outbox.fetch_new(self.config.batch_size).await?;
        let mut pass = ProjectionPass {
            fetched: rows.len(),
            ..ProjectionPass::default()
        };

        for row in &rows {
            match self.relay(row).await {
                Ok(()) => {
                    self.outbox.mark_sent(&[row.id], self.clock.now()).await?;
                    debug!(event_id = %row.id, event_type = %row.event_type, "outbox row sent");
                    pass.sent += 1;
                }
                Err(err) => {
                    let status = self
                        .outbox
                        .record_failure(row.id, &err.to_string(), self.config.max_retries)
                        .await?;
                    if status == OutboxStatus::Err {
                        error!(
                            event_id = %row.id,
                            attempts = row.retry_cnt + 1,
                            error = %err,
                            "outbox row dead-lettered"
                        );
                        pass.dead_lettered += 1;
                    } else {
                        warn!(
                            event_id = %row.id,
                            attempts = row.retry_cnt + 1,
                            error = %err,
                            "outbox publish failed, will retry"
                        );
                        pass.retried += 1;
                    }
                }
            }
        }
        Ok(pass)
    }

    /// Polls until `stop` is called. A full batch is followed immediately by
    /// another poll; otherwise the loop sleeps `poll_interval`.
    pub async fn run_forever(&self) {
        let mut stop = self.stop_tx.subscribe();
        info!(
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "outbox projector started"
        );
        while !*stop.borrow() {
            let full_batch = match self.run_once().await {
                Ok(pass) => {
                    if pass.fetched > 0 {
                        info!(
                            sent = pass.sent,
                            retried = pass.retried,
                            dead_lettered = pass.dead_lettered,
                            "outbox pass complete"
                        );
                    }
                    pass.fetched >= self.config.batch_size as usize
                }
                Err(err) => {
                    warn!(error = %err, reason_code = err.reason_code(), "outbox poll failed");
                    false
                }
            };
            if full_batch {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                _ = stop.changed() => {}
            }
        }
        info!("outbox projector stopped");
    }

    /// Requests shutdown. The current batch finishes first.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Whether `stop` was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Starts `run_forever` on a tokio task.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> ProjectorHandle {
        let projector = self.clone();
        let task = tokio::spawn(async move { projector.run_forever().await });
        ProjectorHandle {
            projector: self,
            task,
        }
    }

    /// Moves a dead-lettered row back to `NEW` with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns outbox repository errors.
    pub async fn requeue(&self, id: Uuid) -> Result<bool, DomainError> {
        let requeued = self.outbox.requeue(id).await?;
        if requeued {
            info!(event_id = %id, "dead-lettered outbox row requeued");
        }
        Ok(requeued)
    }

    /// Deletes rows sent before `before`.
    ///
    /// # Errors
    ///
    /// Returns outbox repository errors.
    pub async fn purge_sent(&self, before: DateTime<Utc>) -> Result<u64, DomainError> {
        let purged = self.outbox.purge_sent(before).await?;
        if purged > 0 {
            info!(purged, %before, "purged sent outbox rows");
        }
        Ok(purged)
    }
}

/// A running projector task.
#[derive(Debug)]
pub struct ProjectorHandle {
    projector: Arc<OutboxProjector>,
    task: JoinHandle<()>,
}

impl ProjectorHandle {
    /// The projector driven by this task.
    #[must_use]
    pub fn projector(&self) -> &Arc<OutboxProjector> {
        &self.projector
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the projector and waits for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the task panicked or was
    /// aborted.
    pub async fn shutdown(self) -> Result<(), DomainError> {
        self.projector.stop();
        self.task
            .await
            .map_err(|e| DomainError::Infrastructure(format!("outbox projector task failed: {e}")))
    }
}
