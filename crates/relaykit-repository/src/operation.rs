//! Persistence operations as they travel through the interceptor chain.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relaykit_core::repository::{EntityRecord, Query};
use relaykit_uow::AfterCommit;

/// An update of one record, checked against the version the caller read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    /// The new state. Its `version` is rewritten by the optimistic-lock
    /// interceptor.
    pub record: EntityRecord,
    /// Version the caller loaded the entity at.
    pub expected_version: i64,
}

/// How a delete is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove the row.
    Hard,
    /// Keep the row and mark it with `deleted_at`.
    Soft {
        /// Deletion timestamp written into the entity data.
        deleted_at: DateTime<Utc>,
    },
}

/// Removal of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDelete {
    /// Entity id.
    pub id: String,
    /// Version the caller loaded the entity at, if it should be checked.
    pub expected_version: Option<i64>,
    /// Hard or soft delete.
    pub mode: DeleteMode,
}

/// A persistence operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Point lookup by id.
    Get {
        /// Entity id.
        id: String,
    },
    /// Filtered listing.
    Query(Query),
    /// Insert one record.
    Create(EntityRecord),
    /// Update one record.
    Update(RecordUpdate),
    /// Delete one record.
    Delete(RecordDelete),
    /// Insert several records.
    CreateMany(Vec<EntityRecord>),
    /// Update several records.
    UpdateMany(Vec<RecordUpdate>),
    /// Delete several records.
    DeleteMany(Vec<RecordDelete>),
}

impl Operation {
    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Query(_) => "query",
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
            Self::CreateMany(_) => "create_many",
            Self::UpdateMany(_) => "update_many",
            Self::DeleteMany(_) => "delete_many",
        }
    }

    /// Whether the operation only reads.
    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get { .. } | Self::Query(_))
    }

    /// Whether the operation is a batch variant.
    #[must_use]
    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            Self::CreateMany(_) | Self::UpdateMany(_) | Self::DeleteMany(_)
        )
    }

    /// Ids of the entities the operation targets. Empty for queries.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        match self {
            Self::Get { id } => vec![id.as_str()],
            Self::Query(_) => Vec::new(),
            Self::Create(record) => vec![record.id.as_str()],
            Self::Update(update) => vec![update.record.id.as_str()],
            Self::Delete(delete) => vec![delete.id.as_str()],
            Self::CreateMany(records) => records.iter().map(|r| r.id.as_str()).collect(),
            Self::UpdateMany(updates) => updates.iter().map(|u| u.record.id.as_str()).collect(),
            Self::DeleteMany(deletes) => deletes.iter().map(|d| d.id.as_str()).collect(),
        }
    }
}

/// The operation plus the entity type it applies to. Interceptors may
/// rewrite the operation before passing it on, and may defer work until the
/// caller's unit of work commits.
#[derive(Clone)]
pub struct OperationContext {
    /// Entity type name.
    pub entity_type: String,
    /// The operation being executed.
    pub operation: Operation,
    deferred: Vec<Arc<dyn AfterCommit>>,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("entity_type", &self.entity_type)
            .field("operation", &self.operation)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

impl OperationContext {
    /// Creates a context.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, operation: Operation) -> Self {
        Self {
            entity_type: entity_type.into(),
            operation,
            deferred: Vec::new(),
        }
    }

    /// Queues a hook for the unit of work the write is staged into. Ignored
    /// for reads.
    pub fn defer(&mut self, hook: Arc<dyn AfterCommit>) {
        self.deferred.push(hook);
    }

    /// Removes and returns the queued hooks.
    pub fn take_deferred(&mut self) -> Vec<Arc<dyn AfterCommit>> {
        std::mem::take(&mut self.deferred)
    }
}

/// Result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Result of `Get`.
    Found(Option<EntityRecord>),
    /// Result of `Query`.
    Listed(Vec<EntityRecord>),
    /// Records staged by a create or update, or by a soft delete.
    Written(Vec<EntityRecord>),
    /// Ids of hard-deleted records.
    Removed(Vec<String>),
}

impl OperationOutcome {
    /// Whether a read came back empty.
    #[must_use]
    pub fn is_empty_read(&self) -> bool {
        match self {
            Self::Found(record) => record.is_none(),
            Self::Listed(records) => records.is_empty(),
            Self::Written(_) | Self::Removed(_) => false,
        }
    }
}
