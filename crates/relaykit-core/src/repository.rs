//! Entity storage abstractions.
//!
//! Entities are stored type-erased as JSON documents keyed by
//! `(entity_type, id)` and carry an optimistic-lock version. Reads go to an
//! [`EntityStore`]; writes are collected into a [`ChangeSet`] and applied
//! atomically, together with outbox rows, by a [`TransactionalStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::outbox::OutboxRecord;

/// Stored representation of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity type name, supplied by the repository.
    pub entity_type: String,
    /// Entity identifier, unique within its type.
    pub id: String,
    /// Optimistic-lock version; the first persisted version is 1.
    pub version: i64,
    /// Serialized entity state.
    pub data: serde_json::Value,
}

/// Equality filter over top-level entity fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Field name to required value.
    pub filter: serde_json::Map<String, serde_json::Value>,
    /// Fields that must be missing or `null`. Applied before `limit`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub absent: Vec<String>,
    /// Maximum number of records to return.
    pub limit: Option<u32>,
}

impl Query {
    /// Creates an empty query that matches every record of a type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality condition.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    /// Requires `field` to be missing or `null`.
    #[must_use]
    pub fn without(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.absent.contains(&field) {
            self.absent.push(field);
        }
        self
    }

    /// Limits the number of results.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `data` satisfies every condition of the filter.
    #[must_use]
    pub fn matches(&self, data: &serde_json::Value) -> bool {
        self.filter
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
            && self
                .absent
                .iter()
                .all(|field| data.get(field).is_none_or(serde_json::Value::is_null))
    }
}

/// A single staged entity mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityWrite {
    /// Insert a new entity; fails if it already exists.
    Insert(EntityRecord),
    /// Replace an entity if its stored version equals `expected_version`.
    Update {
        /// The new state, carrying the bumped version.
        record: EntityRecord,
        /// Version the caller read.
        expected_version: i64,
    },
    /// Remove an entity, optionally guarded by a version check.
    Delete {
        /// Entity type name.
        entity_type: String,
        /// Entity identifier.
        id: String,
        /// Version the caller read, if known.
        expected_version: Option<i64>,
    },
}

impl EntityWrite {
    /// Returns the `(entity_type, id)` the write targets.
    #[must_use]
    pub fn key(&self) -> (&str, &str) {
        match self {
            Self::Insert(record) | Self::Update { record, .. } => {
                (record.entity_type.as_str(), record.id.as_str())
            }
            Self::Delete { entity_type, id, .. } => (entity_type.as_str(), id.as_str()),
        }
    }
}

/// The in-memory change set of one unit of work.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    writes: Vec<EntityWrite>,
    outbox: Vec<OutboxRecord>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an entity write.
    pub fn stage(&mut self, write: EntityWrite) {
        self.writes.push(write);
    }

    /// Stages an outbox record unless one with the same id is already
    /// staged. Returns whether the record was added.
    pub fn stage_outbox(&mut self, record: OutboxRecord) -> bool {
        if self.has_outbox(record.id) {
            return false;
        }
        self.outbox.push(record);
        true
    }

    /// Whether an outbox record with `id` is staged.
    #[must_use]
    pub fn has_outbox(&self, id: Uuid) -> bool {
        self.outbox.iter().any(|r| r.id == id)
    }

    /// Staged entity writes, in staging order.
    #[must_use]
    pub fn writes(&self) -> &[EntityWrite] {
        &self.writes
    }

    /// Staged outbox records, in staging order.
    #[must_use]
    pub fn outbox(&self) -> &[OutboxRecord] {
        &self.outbox
    }

    /// Returns the most recently staged write for an entity, if any.
    #[must_use]
    pub fn staged_for(&self, entity_type: &str, id: &str) -> Option<&EntityWrite> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.key() == (entity_type, id))
    }

    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.outbox.is_empty()
    }

    /// Discards everything staged.
    pub fn clear(&mut self) {
        self.writes.clear();
        self.outbox.clear();
    }
}

/// Read side of entity persistence.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Load one entity by id.
    async fn load(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>, DomainError>;

    /// Load every entity of a type matching `query`, ordered by id.
    async fn query(&self, entity_type: &str, query: &Query) -> Result<Vec<EntityRecord>, DomainError>;
}

/// Write side of entity persistence.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Apply every staged entity write and outbox record in one atomic
    /// transaction. Outbox records whose id already exists are skipped.
    ///
    /// A failed apply leaves no trace; the same change set may be applied
    /// again.
    async fn apply(&self, change_set: &ChangeSet) -> Result<(), DomainError>;
}
