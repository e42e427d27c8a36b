//! Integration tests for the `PostgreSQL` adapters. `sqlx::test` creates a
//! scratch database per test on the server named by `DATABASE_URL`.

use chrono::{Duration, TimeZone, Utc};
use relaykit_core::clock::SystemClock;
use relaykit_core::error::DomainError;
use relaykit_core::event::{EventEnvelope, EventMetadata};
use relaykit_core::idempotency::{IdempotencyRecord, IdempotencyRepository, IdempotencyState};
use relaykit_core::outbox::{OutboxRecord, OutboxRepository, OutboxStatus};
use relaykit_core::repository::{
    ChangeSet, EntityRecord, EntityStore, EntityWrite, Query, TransactionalStore,
};
use relaykit_store::{PgEntityStore, PgIdempotencyRepository, PgOutboxRepository};
use sqlx::PgPool;
use uuid::Uuid;

fn order(id: &str, version: i64, status: &str) -> EntityRecord {
    EntityRecord {
        entity_type: "Order".to_string(),
        id: id.to_string(),
        version,
        data: serde_json::json!({"id": id, "status": status}),
    }
}

fn outbox_row(aggregate_id: &str) -> OutboxRecord {
    let envelope = EventEnvelope::new(
        EventMetadata::new(aggregate_id, "tenant-1", Uuid::new_v4(), &SystemClock),
        "order.placed",
        serde_json::json!({"aggregate": aggregate_id}),
    );
    OutboxRecord::from_envelope(&envelope, Utc::now()).unwrap()
}

async fn seed(store: &PgEntityStore, records: &[EntityRecord]) {
    let mut change_set = ChangeSet::new();
    for record in records {
        change_set.stage(EntityWrite::Insert(record.clone()));
    }
    store.apply(&change_set).await.unwrap();
}

// --- entities ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_load_returns_none_for_missing_entity(pool: PgPool) {
    let store = PgEntityStore::new(pool);

    let loaded = store.load("Order", "missing").await.unwrap();

    assert!(loaded.is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_apply_writes_entities_and_outbox_together(pool: PgPool) {
    // Arrange
    let store = PgEntityStore::new(pool.clone());
    let outbox = PgOutboxRepository::new(pool);
    let row = outbox_row("o-1");
    let mut change_set = ChangeSet::new();
    change_set.stage(EntityWrite::Insert(order("o-1", 1, "open")));
    change_set.stage_outbox(row.clone());

    // Act
    store.apply(&change_set).await.unwrap();

    // Assert
    assert_eq!(store.load("Order", "o-1").await.unwrap(), Some(order("o-1", 1, "open")));
    let stored = outbox.find(row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::New);
    assert_eq!(stored.envelope().unwrap().event_id(), row.id);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_stale_update_rolls_back_the_whole_change_set(pool: PgPool) {
    // Arrange
    let store = PgEntityStore::new(pool.clone());
    let outbox = PgOutboxRepository::new(pool);
    seed(&store, &[order("o-1", 2, "open")]).await;
    let row = outbox_row("o-1");
    let mut change_set = ChangeSet::new();
    change_set.stage(EntityWrite::Insert(order("o-2", 1, "open")));
    change_set.stage(EntityWrite::Update {
        record: order("o-1", 2, "paid"),
        expected_version: 1,
    });
    change_set.stage_outbox(row.clone());

    // Act
    let result = store.apply(&change_set).await;

    // Assert
    assert_eq!(
        result.unwrap_err(),
        DomainError::ConcurrencyConflict {
            aggregate_id: "o-1".to_string(),
            expected: 1,
            actual: 2,
        }
    );
    assert!(store.load("Order", "o-2").await.unwrap().is_none());
    assert!(outbox.find(row.id).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_insert_of_existing_id_is_a_conflict(pool: PgPool) {
    let store = PgEntityStore::new(pool);
    seed(&store, &[order("o-1", 3, "open")]).await;
    let mut change_set = ChangeSet::new();
    change_set.stage(EntityWrite::Insert(order("o-1", 1, "open")));

    let result = store.apply(&change_set).await;

    assert!(matches!(
        result,
        Err(DomainError::ConcurrencyConflict { expected: 0, actual: 3, .. })
    ));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_delete_of_missing_entity_is_not_found(pool: PgPool) {
    let store = PgEntityStore::new(pool);
    let mut change_set = ChangeSet::new();
    change_set.stage(EntityWrite::Delete {
        entity_type: "Order".to_string(),
        id: "ghost".to_string(),
        expected_version: None,
    });

    let result = store.apply(&change_set).await;

    assert!(matches!(result, Err(DomainError::NotFound { .. })));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_query_filters_by_containment_and_limit(pool: PgPool) {
    let store = PgEntityStore::new(pool);
    seed(
        &store,
        &[order("o-1", 1, "open"), order("o-2", 1, "paid"), order("o-3", 1, "open")],
    )
    .await;

    let open = store.query("Order", &Query::new().eq("status", "open")).await.unwrap();
    let first = store
        .query("Order", &Query::new().eq("status", "open").limit(1))
        .await
        .unwrap();

    assert_eq!(open.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["o-1", "o-3"]);
    assert_eq!(first.len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_query_excludes_absent_fields_before_the_limit(pool: PgPool) {
    let store = PgEntityStore::new(pool);
    let mut deleted = order("o-1", 2, "open");
    deleted.data["deleted_at"] = serde_json::json!("2026-01-01T00:00:00Z");
    let mut cleared = order("o-2", 1, "open");
    cleared.data["deleted_at"] = serde_json::Value::Null;
    seed(&store, &[deleted, cleared, order("o-3", 1, "open")]).await;

    let page = store
        .query("Order", &Query::new().without("deleted_at").limit(1))
        .await
        .unwrap();
    let live = store
        .query("Order", &Query::new().without("deleted_at"))
        .await
        .unwrap();

    assert_eq!(page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["o-2"]);
    assert_eq!(live.len(), 2);
}

// --- outbox ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_duplicate_outbox_insert_is_ignored(pool: PgPool) {
    let store = PgEntityStore::new(pool.clone());
    let outbox = PgOutboxRepository::new(pool);
    let row = outbox_row("o-1");
    let mut change_set = ChangeSet::new();
    change_set.stage_outbox(row.clone());

    store.apply(&change_set).await.unwrap();
    store.apply(&change_set).await.unwrap();

    assert_eq!(outbox.fetch_new(10).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_rows_of_one_commit_are_fetched_in_staging_order(pool: PgPool) {
    // Arrange
    let store = PgEntityStore::new(pool.clone());
    let outbox = PgOutboxRepository::new(pool);
    let created_at = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
    let mut rows: Vec<OutboxRecord> = (0..5)
        .map(|_| {
            let mut row = outbox_row("o-1");
            row.created_at = created_at;
            row
        })
        .collect();
    rows.sort_by_key(|r| std::cmp::Reverse(r.id));
    let mut change_set = ChangeSet::new();
    for row in &rows {
        change_set.stage_outbox(row.clone());
    }

    // Act
    store.apply(&change_set).await.unwrap();
    let fetched = outbox.fetch_new(10).await.unwrap();

    // Assert
    assert_eq!(
        fetched.iter().map(|r| r.id).collect::<Vec<_>>(),
        rows.iter().map(|r| r.id).collect::<Vec<_>>()
    );
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_failures_dead_letter_and_requeue_resets_budget(pool: PgPool) {
    // Arrange
    let store = PgEntityStore::new(pool.clone());
    let outbox = PgOutboxRepository::new(pool);
    let row = outbox_row("o-1");
    let mut change_set = ChangeSet::new();
    change_set.stage_outbox(row.clone());
    store.apply(&change_set).await.unwrap();

    // Act
    let first = outbox.record_failure(row.id, "broker down", 1).await.unwrap();
    let second = outbox.record_failure(row.id, "broker down", 1).await.unwrap();
    let after_dead = outbox.record_failure(row.id, "broker down", 1).await.unwrap();
    let dead = outbox.find(row.id).await.unwrap().unwrap();
    let requeued = outbox.requeue(row.id).await.unwrap();
    let revived = outbox.find(row.id).await.unwrap().unwrap();

    // Assert
    assert_eq!((first, second, after_dead), (OutboxStatus::New, OutboxStatus::Err, OutboxStatus::Err));
    assert_eq!(dead.retry_cnt, 2);
    assert_eq!(dead.last_error.as_deref(), Some("broker down"));
    assert!(requeued);
    assert_eq!(revived.status, OutboxStatus::New);
    assert_eq!(revived.retry_cnt, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_mark_sent_then_purge(pool: PgPool) {
    let store = PgEntityStore::new(pool.clone());
    let outbox = PgOutboxRepository::new(pool);
    let sent = outbox_row("o-1");
    let pending = outbox_row("o-2");
    let mut change_set = ChangeSet::new();
    change_set.stage_outbox(sent.clone());
    change_set.stage_outbox(pending.clone());
    store.apply(&change_set).await.unwrap();
    let sent_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

    let marked = outbox.mark_sent(&[sent.id], sent_at).await.unwrap();
    let purged = outbox.purge_sent(sent_at + Duration::days(7)).await.unwrap();

    assert_eq!((marked, purged), (1, 1));
    assert!(outbox.find(sent.id).await.unwrap().is_none());
    assert_eq!(outbox.fetch_new(10).await.unwrap()[0].id, pending.id);
}

// --- idempotency ---

fn claim(key: &str, hash: &str) -> IdempotencyRecord {
    let now = Utc::now();
    IdempotencyRecord {
        idempotency_key: key.to_string(),
        tenant_id: "tenant-1".to_string(),
        operation: "post_orders".to_string(),
        request_hash: hash.to_string(),
        response: None,
        status_code: None,
        state: IdempotencyState::Pending,
        created_at: now,
        expires_at: now + Duration::hours(24),
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_idempotency_claim_complete_and_find(pool: PgPool) {
    let repo = PgIdempotencyRepository::new(pool);

    let first = repo.insert_if_absent(&claim("K1", "h1")).await.unwrap();
    let second = repo.insert_if_absent(&claim("K1", "h2")).await.unwrap();
    let completed = repo
        .complete("K1", &serde_json::json!({"order_id": "o-1"}), 201)
        .await
        .unwrap();
    let stored = repo.find("K1").await.unwrap().unwrap();

    assert!(first);
    assert!(!second);
    assert!(completed);
    assert_eq!(stored.state, IdempotencyState::Completed);
    assert_eq!(stored.request_hash, "h1");
    assert_eq!(stored.status_code, Some(201));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_idempotency_reclaim_only_failed_or_expired(pool: PgPool) {
    let repo = PgIdempotencyRepository::new(pool);
    repo.insert_if_absent(&claim("K1", "h1")).await.unwrap();

    let while_pending = repo.reclaim(&claim("K1", "h2"), Utc::now()).await.unwrap();
    repo.fail("K1").await.unwrap();
    let after_failure = repo.reclaim(&claim("K1", "h2"), Utc::now()).await.unwrap();

    assert!(!while_pending);
    assert!(after_failure);
    let stored = repo.find("K1").await.unwrap().unwrap();
    assert_eq!(stored.state, IdempotencyState::Pending);
    assert_eq!(stored.request_hash, "h2");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_idempotency_delete_expired(pool: PgPool) {
    let repo = PgIdempotencyRepository::new(pool);
    repo.insert_if_absent(&claim("K1", "h1")).await.unwrap();

    let early = repo.delete_expired(Utc::now()).await.unwrap();
    let late = repo.delete_expired(Utc::now() + Duration::hours(25)).await.unwrap();

    assert_eq!((early, late), (0, 1));
}
