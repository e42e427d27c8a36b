//! Built-in interceptors: audit fields, soft delete and optimistic locking.

use std::sync::Arc;

use relaykit_core::clock::Clock;
use relaykit_core::error::DomainError;
use relaykit_core::repository::EntityRecord;
use serde_json::Value;

use crate::chain::Interceptor;
use crate::operation::{DeleteMode, Operation, OperationContext, OperationOutcome};

/// Field holding the creation timestamp.
pub const CREATED_AT_FIELD: &str = "created_at";
/// Field holding the last modification timestamp.
pub const UPDATED_AT_FIELD: &str = "updated_at";
/// Field marking a soft-deleted record.
pub const DELETED_AT_FIELD: &str = "deleted_at";

fn set_field(record: &mut EntityRecord, field: &str, value: Value) -> Result<(), DomainError> {
    match record.data.as_object_mut() {
        Some(object) => {
            object.insert(field.to_owned(), value);
            Ok(())
        }
        None => Err(DomainError::Validation(format!(
            "{} {} is not stored as a JSON object",
            record.entity_type, record.id
        ))),
    }
}

/// Stamps `created_at` and `updated_at` into written records.
pub struct AuditInterceptor {
    clock: Arc<dyn Clock>,
}

impl AuditInterceptor {
    /// Creates an audit interceptor.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn stamp(&self, operation: &mut Operation) -> Result<(), DomainError> {
        let now = serde_json::to_value(self.clock.now())?;
        match operation {
            Operation::Create(record) => {
                set_field(record, CREATED_AT_FIELD, now.clone())?;
                set_field(record, UPDATED_AT_FIELD, now)
            }
            Operation::CreateMany(records) => records.iter_mut().try_for_each(|record| {
                set_field(record, CREATED_AT_FIELD, now.clone())?;
                set_field(record, UPDATED_AT_FIELD, now.clone())
            }),
            Operation::Update(update) => set_field(&mut update.record, UPDATED_AT_FIELD, now),
            Operation::UpdateMany(updates) => updates
                .iter_mut()
                .try_for_each(|update| set_field(&mut update.record, UPDATED_AT_FIELD, now.clone())),
            _ => Ok(()),
        }
    }
}

impl Interceptor for AuditInterceptor {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn before_operation(&self, ctx: &mut OperationContext) -> Result<(), DomainError> {
        self.stamp(&mut ctx.operation)
    }

    fn before_batch(&self, ctx: &mut OperationContext) -> Result<(), DomainError> {
        self.stamp(&mut ctx.operation)
    }
}

/// Turns deletes into `deleted_at` markers and hides marked records from
/// reads.
pub struct SoftDeleteInterceptor {
    clock: Arc<dyn Clock>,
}

impl SoftDeleteInterceptor {
    /// Creates a soft-delete interceptor.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Whether a record carries a deletion marker.
    #[must_use]
    pub fn is_deleted(record: &EntityRecord) -> bool {
        record
            .data
            .get(DELETED_AT_FIELD)
            .is_some_and(|value| !value.is_null())
    }

    fn mark(&self, operation: &mut Operation) {
        let deleted_at = self.clock.now();
        match operation {
            Operation::Delete(delete) => delete.mode = DeleteMode::Soft { deleted_at },
            Operation::DeleteMany(deletes) => {
                for delete in deletes {
                    delete.mode = DeleteMode::Soft { deleted_at };
                }
            }
            Operation::Query(query) => {
                *query = std::mem::take(query).without(DELETED_AT_FIELD);
            }
            _ => {}
        }
    }
}

impl Interceptor for SoftDeleteInterceptor {
    fn name(&self) -> &'static str {
        "soft_delete"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn before_operation(&self, ctx: &mut OperationContext) -> Result<(), DomainError> {
        self.mark(&mut ctx.operation);
        Ok(())
    }

    fn before_batch(&self, ctx: &mut OperationContext) -> Result<(), DomainError> {
        self.mark(&mut ctx.operation);
        Ok(())
    }

    fn after_operation(
        &self,
        _ctx: &OperationContext,
        outcome: &mut OperationOutcome,
    ) -> Result<(), DomainError> {
        match outcome {
            OperationOutcome::Found(found) => {
                if found.as_ref().is_some_and(Self::is_deleted) {
                    *found = None;
                }
            }
            OperationOutcome::Listed(records) => records.retain(|r| !Self::is_deleted(r)),
            OperationOutcome::Written(_) | OperationOutcome::Removed(_) => {}
        }
        Ok(())
    }
}

/// Assigns versions to written records: 1 on create, expected + 1 on update.
///
/// The terminal and the store compare `expected_version` against the stored
/// version, so a stale write fails with `ConcurrencyConflict`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OptimisticLockInterceptor;

impl OptimisticLockInterceptor {
    /// Creates an optimistic-lock interceptor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn check_version(id: &str, version: i64) -> Result<(), DomainError> {
        if version <= 0 {
            return Err(DomainError::Validation(format!(
                "entity {id} has no persisted version (got {version})"
            )));
        }
        Ok(())
    }

    fn assign(operation: &mut Operation) -> Result<(), DomainError> {
        match operation {
            Operation::Create(record) => record.version = 1,
            Operation::CreateMany(records) => {
                for record in records {
                    record.version = 1;
                }
            }
            Operation::Update(update) => {
                Self::check_version(&update.record.id, update.expected_version)?;
                update.record.version = update.expected_version + 1;
            }
            Operation::UpdateMany(updates) => {
                for update in updates {
                    Self::check_version(&update.record.id, update.expected_version)?;
                    update.record.version = update.expected_version + 1;
                }
            }
            Operation::Delete(delete) => {
                if let Some(expected) = delete.expected_version {
                    Self::check_version(&delete.id, expected)?;
                }
            }
            Operation::DeleteMany(deletes) => {
                for delete in deletes {
                    if let Some(expected) = delete.expected_version {
                        Self::check_version(&delete.id, expected)?;
                    }
                }
            }
            Operation::Get { .. } | Operation::Query(_) => {}
        }
        Ok(())
    }
}

impl Interceptor for OptimisticLockInterceptor {
    fn name(&self) -> &'static str {
        "optimistic_lock"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn before_operation(&self, ctx: &mut OperationContext) -> Result<(), DomainError> {
        Self::assign(&mut ctx.operation)
    }

    fn before_batch(&self, ctx: &mut OperationContext) -> Result<(), DomainError> {
        Self::assign(&mut ctx.operation)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use relaykit_core::repository::Query;
    use relaykit_test_support::FixedClock;

    use super::*;
    use crate::operation::{RecordDelete, RecordUpdate};

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()))
    }

    fn record(id: &str, version: i64) -> EntityRecord {
        EntityRecord {
            entity_type: "Order".into(),
            id: id.into(),
            version,
            data: serde_json::json!({"status": "open"}),
        }
    }

    #[test]
    fn test_audit_stamps_created_and_updated_on_create() {
        // Arrange
        let audit = AuditInterceptor::new(clock());
        let mut ctx = OperationContext::new("Order", Operation::Create(record("o-1", 0)));

        // Act
        audit.before_operation(&mut ctx).unwrap();

        // Assert
        let Operation::Create(stamped) = &ctx.operation else {
            panic!("operation changed kind");
        };
        assert_eq!(stamped.data["created_at"], "2026-05-04T12:00:00Z");
        assert_eq!(stamped.data["updated_at"], "2026-05-04T12:00:00Z");
    }

    #[test]
    fn test_audit_only_touches_updated_at_on_update() {
        let audit = AuditInterceptor::new(clock());
        let mut ctx = OperationContext::new(
            "Order",
            Operation::UpdateMany(vec![RecordUpdate {
                record: record("o-1", 2),
                expected_version: 2,
            }]),
        );

        audit.before_batch(&mut ctx).unwrap();

        let Operation::UpdateMany(updates) = &ctx.operation else {
            panic!("operation changed kind");
        };
        assert!(updates[0].record.data.get("created_at").is_none());
        assert_eq!(updates[0].record.data["updated_at"], "2026-05-04T12:00:00Z");
    }

    #[test]
    fn test_audit_rejects_non_object_data() {
        let audit = AuditInterceptor::new(clock());
        let mut bad = record("o-1", 0);
        bad.data = serde_json::json!([1, 2]);
        let mut ctx = OperationContext::new("Order", Operation::Create(bad));

        let err = audit.before_operation(&mut ctx).unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn test_soft_delete_marks_deletes_and_hides_marked_reads() {
        // Arrange
        let soft = SoftDeleteInterceptor::new(clock());
        let mut ctx = OperationContext::new(
            "Order",
            Operation::Delete(RecordDelete {
                id: "o-1".into(),
                expected_version: Some(1),
                mode: DeleteMode::Hard,
            }),
        );
        let mut deleted = record("o-2", 3);
        deleted.data["deleted_at"] = serde_json::json!("2026-05-01T00:00:00Z");
        let mut listed = OperationOutcome::Listed(vec![record("o-1", 1), deleted.clone()]);
        let mut found = OperationOutcome::Found(Some(deleted));

        // Act
        soft.before_operation(&mut ctx).unwrap();
        soft.after_operation(&ctx, &mut listed).unwrap();
        soft.after_operation(&ctx, &mut found).unwrap();

        // Assert
        let Operation::Delete(delete) = &ctx.operation else {
            panic!("operation changed kind");
        };
        assert!(matches!(delete.mode, DeleteMode::Soft { .. }));
        assert_eq!(listed, OperationOutcome::Listed(vec![record("o-1", 1)]));
        assert_eq!(found, OperationOutcome::Found(None));
    }

    #[test]
    fn test_soft_delete_pushes_the_filter_into_queries() {
        let soft = SoftDeleteInterceptor::new(clock());
        let mut ctx = OperationContext::new("Order", Operation::Query(Query::new().limit(1)));

        soft.before_operation(&mut ctx).unwrap();

        let Operation::Query(query) = &ctx.operation else {
            panic!("operation changed kind");
        };
        assert_eq!(query.absent, vec![DELETED_AT_FIELD.to_owned()]);
        assert_eq!(query.limit, Some(1));
    }

    #[test]
    fn test_optimistic_lock_versions_creates_and_updates() {
        let lock = OptimisticLockInterceptor::new();
        let mut create = OperationContext::new("Order", Operation::Create(record("o-1", 0)));
        let mut update = OperationContext::new(
            "Order",
            Operation::Update(RecordUpdate {
                record: record("o-1", 4),
                expected_version: 4,
            }),
        );

        lock.before_operation(&mut create).unwrap();
        lock.before_operation(&mut update).unwrap();

        assert!(matches!(&create.operation, Operation::Create(r) if r.version == 1));
        assert!(matches!(
            &update.operation,
            Operation::Update(u) if u.record.version == 5 && u.expected_version == 4
        ));
    }

    #[test]
    fn test_optimistic_lock_rejects_unversioned_updates() {
        let lock = OptimisticLockInterceptor::new();
        let mut ctx = OperationContext::new(
            "Order",
            Operation::Update(RecordUpdate {
                record: record("o-1", 0),
                expected_version: 0,
            }),
        );

        let err = lock.before_operation(&mut ctx).unwrap_err();

        assert_eq!(err.reason_code(), "VALIDATION_FAILED");
    }
}
