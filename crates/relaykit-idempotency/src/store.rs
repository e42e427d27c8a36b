//! Idempotency store: claims keys and replays stored responses.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relaykit_core::clock::{self, Clock, SystemClock};
use relaykit_core::error::DomainError;
use relaykit_core::idempotency::{IdempotencyRecord, IdempotencyRepository, IdempotencyState};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::request::validate_key;

/// Attempts at claiming a key that keeps changing under us.
const CLAIM_ATTEMPTS: usize = 3;

/// Idempotency settings.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long a record counts after it is claimed.
    pub ttl: Duration,
    /// Delay between checks while another request holds the key.
    pub poll_interval: Duration,
    /// How long `execute` waits on an in-flight key.
    pub wait_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_millis(100),
            wait_timeout: Duration::from_secs(5),
        }
    }
}

impl IdempotencyConfig {
    /// Sets the record TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the in-flight poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the in-flight wait timeout.
    #[must_use]
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }
}

/// Result of claiming a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller owns the key and should run the operation.
    Acquired,
    /// Another request with the same payload holds the key.
    InFlight,
    /// The operation already completed; here is its response.
    Replay {
        /// Stored response body.
        response: Value,
        /// Stored response status.
        status_code: u16,
    },
}

/// Response returned by `IdempotencyStore::execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentResponse {
    /// Response body.
    pub response: Value,
    /// Response status.
    pub status_code: u16,
    /// Whether the response came from a stored record.
    pub replayed: bool,
}

/// Claims idempotency keys and stores the responses of finished operations.
pub struct IdempotencyStore {
    repo: Arc<dyn IdempotencyRepository>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdempotencyStore {
    /// Creates a store on the system clock.
    #[must_use]
    pub fn new(repo: Arc<dyn IdempotencyRepository>, config: IdempotencyConfig) -> Self {
        Self {
            repo,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replaces the clock used for `created_at` and expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    fn pending_record(
        &self,
        key: &str,
        tenant_id: &str,
        operation: &str,
        request_hash: &str,
    ) -> Result<IdempotencyRecord, DomainError> {
        let created_at = self.clock.now();
        let ttl = clock::span(self.config.ttl)?;
        Ok(IdempotencyRecord {
            idempotency_key: key.to_owned(),
            tenant_id: tenant_id.to_owned(),
            operation: operation.to_owned(),
            request_hash: request_hash.to_owned(),
            response: None,
            status_code: None,
            state: IdempotencyState::Pending,
            created_at,
            expires_at: created_at + ttl,
        })
    }

    /// Claims `key` for a request.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a malformed key,
    /// `DomainError::IdempotencyConflict` if the key was used by a different
    /// request or tenant, and repository errors.
    #[instrument(skip(self, request_hash))]
    pub async fn lock(
        &self,
        key: &str,
        tenant_id: &str,
        operation: &str,
        request_hash: &str,
    ) -> Result<LockOutcome, DomainError> {
        validate_key(key)?;
        let claim = self.pending_record(key, tenant_id, operation, request_hash)?;

        for _ in 0..CLAIM_ATTEMPTS {
            if self.repo.insert_if_absent(&claim).await? {
                debug!("idempotency key claimed");
                return Ok(LockOutcome::Acquired);
            }
            // Deleted between the insert and the lookup; claim again.
            let Some(existing) = self.repo.find(key).await? else {
                continue;
            };

            if existing.is_expired(claim.created_at) {
                if self.repo.reclaim(&claim, claim.created_at).await? {
                    debug!("expired idempotency key reclaimed");
                    return Ok(LockOutcome::Acquired);
                }
                continue;
            }
            if existing.request_hash != request_hash || existing.tenant_id != tenant_id {
                warn!("idempotency key reused with a different request");
                return Err(DomainError::IdempotencyConflict {
                    key: key.to_owned(),
                });
            }
            match existing.state {
                IdempotencyState::Pending => return Ok(LockOutcome::InFlight),
                IdempotencyState::Completed => {
                    return Ok(LockOutcome::Replay {
                        response: existing.response.unwrap_or(Value::Null),
                        status_code: existing.status_code.unwrap_or(200),
                    });
                }
                IdempotencyState::Failed => {
                    if self.repo.reclaim(&claim, claim.created_at).await? {
                        debug!("failed idempotency key reclaimed");
                        return Ok(LockOutcome::Acquired);
                    }
                }
            }
        }

        Err(DomainError::Infrastructure(format!(
            "could not claim idempotency key {key}: record kept changing"
        )))
    }

    /// Stores the response of a finished operation.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if the key is not pending, and
    /// repository errors.
    pub async fn store_response(
        &self,
        key: &str,
        response: &Value,
        status_code: u16,
    ) -> Result<(), DomainError> {
        if self.repo.complete(key, response, status_code).await? {
            Ok(())
        } else {
            Err(pending_not_found(key))
        }
    }

    /// Marks a claimed key failed so a retry may run the operation again.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if the key is not pending, and
    /// repository errors.
    pub async fn mark_failed(&self, key: &str) -> Result<(), DomainError> {
        if self.repo.fail(key).await? {
            Ok(())
        } else {
            Err(pending_not_found(key))
        }
    }

    /// Deletes expired records.
    ///
    /// # Errors
    ///
    /// Returns repository errors.
    pub async fn cleanup_expired(&self) -> Result<u64, DomainError> {
        let purged = self.repo.delete_expired(self.clock.now()).await?;
        if purged > 0 {
            info!(purged, "expired idempotency records deleted");
        }
        Ok(purged)
    }

    /// Runs `operation_fn` at most once per key.
    ///
    /// A completed key replays its stored response. A key held by another
    /// request is polled every `poll_interval` until it completes or
    /// `wait_timeout` passes. A failed run marks the key failed and returns
    /// the error, leaving the key free for a retry. If the response of a
    /// successful run cannot be stored the key is marked failed as well, so
    /// retries are not held off until it expires.
    ///
    /// # Errors
    ///
    /// Returns errors from `lock`, `DomainError::IdempotencyInFlight` when the
    /// wait times out, and the operation's own error.
    #[instrument(skip(self, request_hash, operation_fn))]
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        tenant_id: &str,
        operation: &str,
        request_hash: &str,
        operation_fn: F,
    ) -> Result<IdempotentResponse, DomainError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Value, u16), DomainError>>,
    {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            match self.lock(key, tenant_id, operation, request_hash).await? {
                LockOutcome::Acquired => break,
                LockOutcome::Replay {
                    response,
                    status_code,
                } => {
                    debug!("replaying stored response");
                    return Ok(IdempotentResponse {
                        response,
                        status_code,
                        replayed: true,
                    });
                }
                LockOutcome::InFlight => {
                    if Instant::now() >= deadline {
                        return Err(DomainError::IdempotencyInFlight {
                            key: key.to_owned(),
                        });
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        match operation_fn().await {
            Ok((response, status_code)) => {
                if let Err(err) = self.store_response(key, &response, status_code).await {
                    warn!(error = %err, "failed to store idempotent response, releasing key");
                    if let Err(mark_err) = self.mark_failed(key).await {
                        error!(error = %mark_err, "failed to release idempotency key");
                    }
                }
                Ok(IdempotentResponse {
                    response,
                    status_code,
                    replayed: false,
                })
            }
            Err(err) => {
                if let Err(mark_err) = self.mark_failed(key).await {
                    warn!(error = %mark_err, "failed to release idempotency key");
                }
                Err(err)
            }
        }
    }
}

fn pending_not_found(key: &str) -> DomainError {
    DomainError::NotFound {
        entity_type: "pending idempotency key".into(),
        id: key.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use relaykit_test_support::{InMemoryStore, ManualClock};
    use serde_json::json;

    use super::*;

    const TENANT: &str = "tenant-1";
    const OP: &str = "post_orders";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<ManualClock>, IdempotencyStore) {
        let repo = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let store = IdempotencyStore::new(repo.clone(), IdempotencyConfig::default())
            .with_clock(clock.clone());
        (repo, clock, store)
    }

    #[tokio::test]
    async fn test_lock_claims_a_fresh_key() {
        let (repo, _clock, store) = setup();

        let outcome = store.lock("K1", TENANT, OP, "h1").await.unwrap();

        assert_eq!(outcome, LockOutcome::Acquired);
        let record = repo.idempotency_record("K1").unwrap();
        assert_eq!(record.state, IdempotencyState::Pending);
        assert_eq!(record.expires_at, start() + chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn test_lock_reports_in_flight_and_conflict() {
        let (_repo, _clock, store) = setup();
        store.lock("K1", TENANT, OP, "h1").await.unwrap();

        let same = store.lock("K1", TENANT, OP, "h1").await.unwrap();
        let different = store.lock("K1", TENANT, OP, "h2").await;
        let other_tenant = store.lock("K1", "tenant-2", OP, "h1").await;

        assert_eq!(same, LockOutcome::InFlight);
        assert_eq!(
            different.unwrap_err(),
            DomainError::IdempotencyConflict { key: "K1".into() }
        );
        assert!(matches!(
            other_tenant,
            Err(DomainError::IdempotencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_key_replays_without_running_again() {
        // Arrange
        let (_repo, _clock, store) = setup();
        let counter = AtomicUsize::new(0);
        let runs = &counter;
        let run = move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok((json!({"order_id": "o-1"}), 201))
        };

        // Act
        let first = store.execute("K1", TENANT, OP, "h1", run).await.unwrap();
        let second = store.execute("K1", TENANT, OP, "h1", run).await.unwrap();

        // Assert
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.response, json!({"order_id": "o-1"}));
        assert_eq!(second.status_code, 201);
    }

    #[tokio::test]
    async fn test_replay_with_a_different_payload_is_a_conflict() {
        let (_repo, _clock, store) = setup();
        store
            .execute("K1", TENANT, OP, "h1", || async { Ok((json!({}), 200)) })
            .await
            .unwrap();

        let result = store
            .execute("K1", TENANT, OP, "h2", || async { Ok((json!({}), 200)) })
            .await;

        assert!(matches!(result, Err(DomainError::IdempotencyConflict { .. })));
    }

    #[tokio::test]
    async fn test_failed_operation_frees_the_key_for_a_retry() {
        // Arrange
        let (repo, _clock, store) = setup();

        // Act
        let failed = store
            .execute("K1", TENANT, OP, "h1", || async {
                Err::<(Value, u16), _>(DomainError::Timeout("downstream".into()))
            })
            .await;
        let state_after_failure = repo.idempotency_record("K1").unwrap().state;
        let retried = store
            .execute("K1", TENANT, OP, "h1", || async { Ok((json!({"ok": true}), 200)) })
            .await
            .unwrap();

        // Assert
        assert_eq!(failed.unwrap_err(), DomainError::Timeout("downstream".into()));
        assert_eq!(state_after_failure, IdempotencyState::Failed);
        assert!(!retried.replayed);
        assert_eq!(
            repo.idempotency_record("K1").unwrap().state,
            IdempotencyState::Completed
        );
    }

    /// Repository whose `complete` always fails.
    struct UnwritableResponses(InMemoryStore);

    #[async_trait]
    impl IdempotencyRepository for UnwritableResponses {
        async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<bool, DomainError> {
            self.0.insert_if_absent(record).await
        }

        async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, DomainError> {
            IdempotencyRepository::find(&self.0, key).await
        }

        async fn reclaim(
            &self,
            record: &IdempotencyRecord,
            now: DateTime<Utc>,
        ) -> Result<bool, DomainError> {
            self.0.reclaim(record, now).await
        }

        async fn complete(
            &self,
            _key: &str,
            _response: &Value,
            _status_code: u16,
        ) -> Result<bool, DomainError> {
            Err(DomainError::Infrastructure("[SQLSTATE 08006] connection reset".into()))
        }

        async fn fail(&self, key: &str) -> Result<bool, DomainError> {
            self.0.fail(key).await
        }

        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DomainError> {
            self.0.delete_expired(now).await
        }
    }

    #[tokio::test]
    async fn test_unstored_response_releases_the_key() {
        // Arrange
        let repo = Arc::new(UnwritableResponses(InMemoryStore::new()));
        let store = IdempotencyStore::new(repo.clone(), IdempotencyConfig::default());
        let counter = AtomicUsize::new(0);
        let runs = &counter;
        let run = move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok((json!({"order_id": "o-1"}), 201))
        };

        // Act
        let first = store.execute("K1", TENANT, OP, "h1", run).await.unwrap();
        let state = repo.0.idempotency_record("K1").unwrap().state;
        let second = store.execute("K1", TENANT, OP, "h1", run).await.unwrap();

        // Assert
        assert_eq!(first.status_code, 201);
        assert_eq!(state, IdempotencyState::Failed);
        assert!(!second.replayed);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_key_is_reclaimed_even_with_a_new_payload() {
        let (_repo, clock, store) = setup();
        store.lock("K1", TENANT, OP, "h1").await.unwrap();
        clock.advance(chrono::Duration::hours(25));

        let outcome = store.lock("K1", TENANT, OP, "h2").await.unwrap();

        assert_eq!(outcome, LockOutcome::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_wait_times_out() {
        let (_repo, _clock, store) = setup();
        store.lock("K1", TENANT, OP, "h1").await.unwrap();
        let started = Instant::now();

        let result = store
            .execute("K1", TENANT, OP, "h1", || async { Ok((json!({}), 200)) })
            .await;

        assert_eq!(
            result.unwrap_err(),
            DomainError::IdempotencyInFlight { key: "K1".into() }
        );
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_replays_once_the_holder_completes() {
        // Arrange
        let (_repo, _clock, store) = setup();
        let store = Arc::new(store);
        store.lock("K1", TENANT, OP, "h1").await.unwrap();
        let holder = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                store
                    .store_response("K1", &json!({"done": 1}), 202)
                    .await
                    .unwrap();
            })
        };

        // Act
        let waited = store
            .execute("K1", TENANT, OP, "h1", || async { Ok((json!({"done": 2}), 200)) })
            .await
            .unwrap();
        holder.await.unwrap();

        // Assert
        assert!(waited.replayed);
        assert_eq!(waited.response, json!({"done": 1}));
        assert_eq!(waited.status_code, 202);
    }

    #[tokio::test]
    async fn test_store_response_requires_a_pending_key() {
        let (_repo, _clock, store) = setup();

        let result = store.store_response("missing", &json!({}), 200).await;

        assert!(matches!(result, Err(DomainError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_records() {
        let (repo, clock, store) = setup();
        store.lock("old", TENANT, OP, "h1").await.unwrap();
        clock.advance(chrono::Duration::hours(20));
        store.lock("new", TENANT, OP, "h1").await.unwrap();
        clock.advance(chrono::Duration::hours(5));

        let purged = store.cleanup_expired().await.unwrap();

        assert_eq!(purged, 1);
        assert!(repo.idempotency_record("old").is_none());
        assert!(repo.idempotency_record("new").is_some());
    }

    #[tokio::test]
    async fn test_malformed_key_is_rejected() {
        let (_repo, _clock, store) = setup();

        let result = store.lock("", TENANT, OP, "h1").await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }
}
