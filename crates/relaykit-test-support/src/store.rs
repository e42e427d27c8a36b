//! In-memory store: one `Mutex`-guarded state that implements every
//! persistence trait, so a test can drive a unit of work, a repository, the
//! outbox relay and the idempotency store against the same data.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaykit_core::error::DomainError;
use relaykit_core::idempotency::{IdempotencyRecord, IdempotencyRepository, IdempotencyState};
use relaykit_core::outbox::{OutboxRecord, OutboxRepository, OutboxStatus};
use relaykit_core::repository::{
    ChangeSet, EntityRecord, EntityStore, EntityWrite, Query, TransactionalStore,
};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
struct State {
    entities: BTreeMap<(String, String), EntityRecord>,
    outbox: Vec<OutboxRecord>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

/// An in-memory implementation of `EntityStore`, `TransactionalStore`,
/// `OutboxRepository` and `IdempotencyRepository`.
///
/// `apply` validates the whole change set against a copy of the state and
/// swaps it in only if every write succeeds, mirroring a database
/// transaction.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    scripted_apply_errors: Mutex<VecDeque<DomainError>>,
    loads: AtomicUsize,
    queries: AtomicUsize,
    applies: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entity directly, bypassing the unit of work.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed(&self, record: EntityRecord) {
        self.state
            .lock()
            .unwrap()
            .entities
            .insert((record.entity_type.clone(), record.id.clone()), record);
    }

    /// Seed an outbox row directly.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed_outbox(&self, record: OutboxRecord) {
        self.state.lock().unwrap().outbox.push(record);
    }

    /// Make the next `apply` calls fail with the given errors, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_next_applies(&self, errors: impl IntoIterator<Item = DomainError>) {
        self.scripted_apply_errors.lock().unwrap().extend(errors);
    }

    /// Returns a stored entity.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn entity(&self, entity_type: &str, id: &str) -> Option<EntityRecord> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(&(entity_type.to_owned(), id.to_owned()))
            .cloned()
    }

    /// Returns a snapshot of every outbox row in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state.lock().unwrap().outbox.clone()
    }

    /// Returns a stored idempotency record.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn idempotency_record(&self, key: &str) -> Option<IdempotencyRecord> {
        self.state.lock().unwrap().idempotency.get(key).cloned()
    }

    /// Number of `EntityStore::load` calls so far.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of `EntityStore::query` calls so far.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `TransactionalStore::apply` calls so far, failed ones
    /// included.
    #[must_use]
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }
}

fn conflict(id: &str, expected: i64, actual: i64) -> DomainError {
    DomainError::ConcurrencyConflict {
        aggregate_id: id.to_owned(),
        expected,
        actual,
    }
}

fn apply_write(state: &mut State, write: &EntityWrite) -> Result<(), DomainError> {
    match write {
        EntityWrite::Insert(record) => {
            let key = (record.entity_type.clone(), record.id.clone());
            if let Some(existing) = state.entities.get(&key) {
                return Err(conflict(&record.id, 0, existing.version));
            }
            state.entities.insert(key, record.clone());
        }
        EntityWrite::Update {
            record,
            expected_version,
        } => {
            let key = (record.entity_type.clone(), record.id.clone());
            let Some(existing) = state.entities.get(&key) else {
                return Err(DomainError::NotFound {
                    entity_type: record.entity_type.clone(),
                    id: record.id.clone(),
                });
            };
            if existing.version != *expected_version {
                return Err(conflict(&record.id, *expected_version, existing.version));
            }
            state.entities.insert(key, record.clone());
        }
        EntityWrite::Delete {
            entity_type,
            id,
            expected_version,
        } => {
            let key = (entity_type.clone(), id.clone());
            let Some(existing) = state.entities.get(&key) else {
                return Err(DomainError::NotFound {
                    entity_type: entity_type.clone(),
                    id: id.clone(),
                });
            };
            if let Some(expected) = expected_version {
                if existing.version != *expected {
                    return Err(conflict(id, *expected, existing.version));
                }
            }
            state.entities.remove(&key);
        }
    }
    Ok(())
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn load(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>, DomainError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.entity(entity_type, id))
    }

    async fn query(&self, entity_type: &str, query: &Query) -> Result<Vec<EntityRecord>, DomainError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        Ok(state
            .entities
            .values()
            .filter(|r| r.entity_type == entity_type && query.matches(&r.data))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn apply(&self, change_set: &ChangeSet) -> Result<(), DomainError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_apply_errors.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut guard = self.state.lock().unwrap();
        let mut next = guard.clone();
        for write in change_set.writes() {
            apply_write(&mut next, write)?;
        }
        for record in change_set.outbox() {
            if !next.outbox.iter().any(|r| r.id == record.id) {
                next.outbox.push(record.clone());
            }
        }
        *guard = next;
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for InMemoryStore {
    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state.outbox.iter().find(|r| r.id == id).cloned())
    }

    async fn fetch_new(&self, limit: u32) -> Result<Vec<OutboxRecord>, DomainError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<OutboxRecord> = state
            .outbox
            .iter()
            .filter(|r| r.status == OutboxStatus::New)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn mark_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> Result<u64, DomainError> {
        let mut state = self.state.lock().unwrap();
        let mut updated = 0;
        for row in state
            .outbox
            .iter_mut()
            .filter(|r| r.status == OutboxStatus::New && ids.contains(&r.id))
        {
            row.status = OutboxStatus::Sent;
            row.sent_at = Some(sent_at);
            updated += 1;
        }
        Ok(updated)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<OutboxStatus, DomainError> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DomainError::NotFound {
                entity_type: "OutboxRecord".into(),
                id: id.to_string(),
            })?;
        if row.status != OutboxStatus::New {
            return Ok(row.status);
        }
        row.retry_cnt += 1;
        row.last_error = Some(error.to_owned());
        if row.retry_cnt > max_retries {
            row.status = OutboxStatus::Err;
        }
        Ok(row.status)
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, DomainError> {
        let mut state = self.state.lock().unwrap();
        match state
            .outbox
            .iter_mut()
            .find(|r| r.id == id && r.status == OutboxStatus::Err)
        {
            Some(row) => {
                row.status = OutboxStatus::New;
                row.retry_cnt = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_sent(&self, before: DateTime<Utc>) -> Result<u64, DomainError> {
        let mut state = self.state.lock().unwrap();
        let initial = state.outbox.len();
        state.outbox.retain(|r| {
            !(r.status == OutboxStatus::Sent && r.sent_at.is_some_and(|at| at < before))
        });
        Ok((initial - state.outbox.len()) as u64)
    }
}

#[async_trait]
impl IdempotencyRepository for InMemoryStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<bool, DomainError> {
        let mut state = self.state.lock().unwrap();
        if state.idempotency.contains_key(&record.idempotency_key) {
            return Ok(false);
        }
        state
            .idempotency
            .insert(record.idempotency_key.clone(), record.clone());
        Ok(true)
    }

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, DomainError> {
        Ok(self.idempotency_record(key))
    }

    async fn reclaim(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        let mut state = self.state.lock().unwrap();
        match state.idempotency.get_mut(&record.idempotency_key) {
            Some(existing)
                if existing.state == IdempotencyState::Failed || existing.is_expired(now) =>
            {
                *existing = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        key: &str,
        response: &serde_json::Value,
        status_code: u16,
    ) -> Result<bool, DomainError> {
        let mut state = self.state.lock().unwrap();
        match state.idempotency.get_mut(key) {
            Some(existing) if existing.state == IdempotencyState::Pending => {
                existing.state = IdempotencyState::Completed;
                existing.response = Some(response.clone());
                existing.status_code = Some(status_code);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(&self, key: &str) -> Result<bool, DomainError> {
        let mut state = self.state.lock().unwrap();
        match state.idempotency.get_mut(key) {
            Some(existing) if existing.state == IdempotencyState::Pending => {
                existing.state = IdempotencyState::Failed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DomainError> {
        let mut state = self.state.lock().unwrap();
        let initial = state.idempotency.len();
        state.idempotency.retain(|_, r| !r.is_expired(now));
        Ok((initial - state.idempotency.len()) as u64)
    }
}
