//! Unit of work: stages entity writes and domain events, commits them in a
//! single store transaction, then publishes the events.
//!
//! A `UnitOfWork` is an explicit handle owned by one task. Events recorded
//! on it are invisible to any other unit of work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relaykit_core::aggregate::{AggregateRoot, EventBuffer};
use relaykit_core::bus::MessageBus;
use relaykit_core::clock::{Clock, SystemClock};
use relaykit_core::error::DomainError;
use relaykit_core::event::EventEnvelope;
use relaykit_core::outbox::OutboxRepository;
use relaykit_core::repository::{ChangeSet, EntityWrite, TransactionalStore};
use relaykit_core::retry::{RetryPolicy, retry};
use relaykit_core::rng::{DeterministicRng, SystemRng};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::outbox_writer::OutboxWriter;

/// Work that must only happen once the store transaction has committed,
/// such as dropping cache entries for the written entities.
#[async_trait]
pub trait AfterCommit: Send + Sync {
    /// Runs after a successful commit. Failures are the hook's to log.
    async fn after_commit(&self);
}

/// Commit and publish behavior of units of work.
#[derive(Debug, Clone)]
pub struct UnitOfWorkConfig {
    /// Publish events right after the commit. When `false` delivery is left
    /// entirely to the outbox relay.
    pub publish_on_commit: bool,
    /// Backoff for the post-commit publish.
    pub publish_retry: RetryPolicy,
    /// Backoff for retryable store failures during the commit itself.
    pub commit_retry: RetryPolicy,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            publish_on_commit: true,
            publish_retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(2)),
            commit_retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(50)),
        }
    }
}

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    /// Accepting writes and events.
    Active,
    /// A commit is running.
    Committing,
    /// The store transaction committed.
    Committed,
    /// Discarded by `rollback` or by a failed commit.
    RolledBack,
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// The unit of work that committed.
    pub uow_id: Uuid,
    /// Ids of the committed events, in record order.
    pub event_ids: Vec<Uuid>,
    /// Number of entity writes applied.
    pub writes: usize,
    /// Whether the events were published immediately.
    pub published: bool,
}

type SharedRng = Arc<Mutex<Box<dyn DeterministicRng + Send>>>;

/// Creates units of work sharing one store, outbox and bus.
#[derive(Clone)]
pub struct UnitOfWorkFactory {
    store: Arc<dyn TransactionalStore>,
    outbox: Arc<dyn OutboxRepository>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    rng: SharedRng,
    config: UnitOfWorkConfig,
}

impl std::fmt::Debug for UnitOfWorkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UnitOfWorkFactory {
    /// Creates a factory with the default configuration, the system clock
    /// and an OS-seeded RNG.
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        outbox: Arc<dyn OutboxRepository>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            store,
            outbox,
            bus,
            clock: Arc::new(SystemClock),
            rng: Arc::new(Mutex::new(Box::new(SystemRng::new()))),
            config: UnitOfWorkConfig::default(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: UnitOfWorkConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the RNG used for backoff jitter.
    #[must_use]
    pub fn with_rng(mut self, rng: Box<dyn DeterministicRng + Send>) -> Self {
        self.rng = Arc::new(Mutex::new(rng));
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    /// Opens a new, empty unit of work.
    #[must_use]
    pub fn begin(&self) -> UnitOfWork {
        let uow = UnitOfWork {
            id: Uuid::new_v4(),
            state: UnitOfWorkState::Active,
            change_set: ChangeSet::new(),
            buffer: EventBuffer::new(),
            writer: OutboxWriter::new(),
            hooks: Vec::new(),
            deps: self.clone(),
        };
        debug!(uow_id = %uow.id, "unit of work started");
        uow
    }
}

/// A single business transaction.
pub struct UnitOfWork {
    id: Uuid,
    state: UnitOfWorkState,
    change_set: ChangeSet,
    buffer: EventBuffer,
    writer: OutboxWriter,
    hooks: Vec<Arc<dyn AfterCommit>>,
    deps: UnitOfWorkFactory,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("change_set", &self.change_set)
            .field("buffer", &self.buffer)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    /// Returns the unit of work id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    /// Whether writes and events are still accepted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == UnitOfWorkState::Active
    }

    /// Returns the clock this unit of work stamps records with.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.deps.clock.as_ref()
    }

    fn ensure_active(&self, action: &str) -> Result<(), DomainError> {
        if self.is_active() {
            return Ok(());
        }
        warn!(uow_id = %self.id, state = ?self.state, action, "unit of work is no longer active");
        Err(DomainError::Validation(format!(
            "cannot {action}: unit of work {} is {:?}",
            self.id, self.state
        )))
    }

    /// Buffers an event for publication after commit. An event whose id is
    /// already buffered is ignored.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the unit of work has already
    /// committed or rolled back.
    pub fn record_event(&mut self, event: EventEnvelope) -> Result<(), DomainError> {
        self.ensure_active("record event")?;
        let event_id = event.event_id();
        if !self.buffer.push(event) {
            debug!(uow_id = %self.id, %event_id, "event already recorded");
        }
        Ok(())
    }

    /// Moves an aggregate's pending events into this unit of work. Events
    /// whose id is already buffered are skipped.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the unit of work is not active,
    /// or `DomainError::Serialization` if an event cannot be encoded.
    pub fn collect<A: AggregateRoot>(&mut self, aggregate: &mut A) -> Result<usize, DomainError> {
        self.ensure_active("collect events")?;
        let count = self.buffer.collect_from(aggregate)?;
        debug!(
            uow_id = %self.id,
            aggregate_id = aggregate.aggregate_id(),
            count,
            "collected aggregate events"
        );
        Ok(count)
    }

    /// Stages an entity write.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the unit of work is not active.
    pub fn stage(&mut self, write: EntityWrite) -> Result<(), DomainError> {
        self.ensure_active("stage write")?;
        self.change_set.stage(write);
        Ok(())
    }

    /// Registers a hook to run once the store transaction commits. Hooks are
    /// dropped on rollback or when the commit fails.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the unit of work is not active.
    pub fn on_commit(&mut self, hook: Arc<dyn AfterCommit>) -> Result<(), DomainError> {
        self.ensure_active("register commit hook")?;
        self.hooks.push(hook);
        Ok(())
    }

    /// Returns the last staged write for an entity, if any.
    #[must_use]
    pub fn staged_for(&self, entity_type: &str, id: &str) -> Option<&EntityWrite> {
        self.change_set.staged_for(entity_type, id)
    }

    /// Returns the staged writes and outbox rows.
    #[must_use]
    pub fn change_set(&self) -> &ChangeSet {
        &self.change_set
    }

    /// Returns the buffered events in record order.
    #[must_use]
    pub fn pending_events(&self) -> &[EventEnvelope] {
        self.buffer.events()
    }

    /// Commits staged writes together with one outbox row per buffered
    /// event, runs the registered after-commit hooks, then publishes the
    /// events.
    ///
    /// The buffer and the hooks are cleared whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the store error if the transaction fails; nothing was
    /// persisted in that case. Returns `DomainError::PublishDeferred` if the
    /// transaction committed but publishing gave up; the outbox relay will
    /// deliver the events.
    #[instrument(skip_all, fields(uow_id = %self.id))]
    pub async fn commit(&mut self) -> Result<CommitReceipt, DomainError> {
        self.ensure_active("commit")?;
        self.state = UnitOfWorkState::Committing;
        let events = self.buffer.drain();
        let hooks = std::mem::take(&mut self.hooks);

        let outcome = self.commit_events(&events, &hooks).await;

        self.change_set.clear();
        self.state = match &outcome {
            Ok(_) | Err(DomainError::PublishDeferred { .. }) => UnitOfWorkState::Committed,
            Err(_) => UnitOfWorkState::RolledBack,
        };
        outcome
    }

    async fn commit_events(
        &mut self,
        events: &[EventEnvelope],
        hooks: &[Arc<dyn AfterCommit>],
    ) -> Result<CommitReceipt, DomainError> {
        let now = self.deps.clock.now();
        let staged = self.writer.before_commit(&mut self.change_set, events, now)?;

        let store = self.deps.store.as_ref();
        let change_set = &self.change_set;
        if let Err(err) = retry(
            &self.deps.config.commit_retry,
            &self.deps.rng,
            "unit_of_work.apply",
            move |_| store.apply(change_set),
        )
        .await
        {
            warn!(error = %err, reason_code = err.reason_code(), "unit of work commit failed");
            return Err(err);
        }

        let mut receipt = CommitReceipt {
            uow_id: self.id,
            event_ids: events.iter().map(EventEnvelope::event_id).collect(),
            writes: change_set.writes().len(),
            published: false,
        };
        info!(writes = receipt.writes, outbox = staged, "unit of work committed");
        for hook in hooks {
            hook.after_commit().await;
        }

        if events.is_empty() || !self.deps.config.publish_on_commit {
            return Ok(receipt);
        }

        let bus = self.deps.bus.as_ref();
        match retry(
            &self.deps.config.publish_retry,
            &self.deps.rng,
            "unit_of_work.publish",
            move |_| bus.publish(events),
        )
        .await
        {
            Ok(()) => {
                receipt.published = true;
                let sent_at = self.deps.clock.now();
                if let Err(err) = self.deps.outbox.mark_sent(&receipt.event_ids, sent_at).await {
                    warn!(
                        error = %err,
                        "events published but outbox rows not marked; the relay will republish them"
                    );
                }
                info!(count = events.len(), "events published");
                Ok(receipt)
            }
            Err(err) => {
                warn!(
                    count = events.len(),
                    error = %err,
                    "publish gave up after commit; events left to the outbox relay"
                );
                Err(DomainError::PublishDeferred {
                    event_count: events.len(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Discards staged writes and buffered events.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the unit of work is not active.
    pub fn rollback(&mut self) -> Result<(), DomainError> {
        self.ensure_active("roll back")?;
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.change_set.clear();
        self.hooks.clear();
        self.state = UnitOfWorkState::RolledBack;
        debug!(uow_id = %self.id, discarded, "unit of work rolled back");
        Ok(())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        match self.state {
            UnitOfWorkState::Active if !self.buffer.is_empty() || !self.change_set.is_empty() => {
                warn!(
                    uow_id = %self.id,
                    events = self.buffer.len(),
                    writes = self.change_set.writes().len(),
                    "unit of work dropped without commit or rollback; pending work discarded"
                );
            }
            UnitOfWorkState::Committing => {
                warn!(uow_id = %self.id, "unit of work dropped while committing");
            }
            _ => {}
        }
    }
}
