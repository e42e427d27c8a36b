//! Read-through cache interceptor.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use relaykit_core::cache::CacheBackend;
use relaykit_core::error::DomainError;
use relaykit_core::repository::EntityRecord;
use relaykit_core::rng::{DeterministicRng, SystemRng};
use relaykit_repository::{
    AfterCommit, Interceptor, Next, Operation, OperationContext, OperationOutcome,
};
use tracing::{debug, warn};

use crate::keys::{self, NULL_MARKER};
use crate::single_flight::SingleFlight;

/// Cache interceptor settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix of every key written.
    pub key_prefix: String,
    /// TTL of positive entries before jitter.
    pub default_ttl: Duration,
    /// TTL of null markers.
    pub negative_ttl: Duration,
    /// Relative spread applied to positive TTLs, e.g. 0.1 for ±10%.
    pub jitter_range: f64,
    /// Deadline for each cache call.
    pub operation_timeout: Duration,
    /// Treat cache failures as misses instead of errors.
    pub fail_open: bool,
    /// Cache empty results with `NULL_MARKER`.
    pub negative_caching: bool,
    /// Collapse concurrent misses for one key into a single origin load.
    pub single_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rk:".into(),
            default_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
            jitter_range: 0.1,
            operation_timeout: Duration::from_millis(50),
            fail_open: true,
            negative_caching: true,
            single_flight: true,
        }
    }
}

impl CacheConfig {
    /// Sets the key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// Sets the positive TTL.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the null-marker TTL.
    #[must_use]
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    /// Sets the TTL jitter, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter_range(mut self, jitter_range: f64) -> Self {
        self.jitter_range = jitter_range.clamp(0.0, 1.0);
        self
    }

    /// Sets the per-call deadline.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Enables or disables fail-open.
    #[must_use]
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Enables or disables negative caching.
    #[must_use]
    pub fn with_negative_caching(mut self, negative_caching: bool) -> Self {
        self.negative_caching = negative_caching;
        self
    }

    /// Enables or disables single-flight loading.
    #[must_use]
    pub fn with_single_flight(mut self, single_flight: bool) -> Self {
        self.single_flight = single_flight;
        self
    }
}

/// Spreads `ttl` uniformly over `[ttl·(1−j), ttl·(1+j)]`.
pub fn apply_jitter(ttl: Duration, jitter_range: f64, rng: &mut dyn DeterministicRng) -> Duration {
    if jitter_range <= 0.0 {
        return ttl;
    }
    let spread = (rng.next_f64() * 2.0 - 1.0) * jitter_range;
    ttl.mul_f64((1.0 + spread).max(0.0))
}

/// Caches reads and invalidates on writes. Runs first in the chain.
pub struct CacheInterceptor {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    flight: SingleFlight<OperationOutcome>,
    rng: Mutex<Box<dyn DeterministicRng + Send>>,
}

impl std::fmt::Debug for CacheInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInterceptor")
            .field("config", &self.config)
            .field("flight", &self.flight)
            .finish_non_exhaustive()
    }
}

impl CacheInterceptor {
    /// Creates an interceptor over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            flight: SingleFlight::new(),
            rng: Mutex::new(Box::new(SystemRng::new())),
        }
    }

    /// Replaces the RNG used for TTL jitter.
    #[must_use]
    pub fn with_rng(mut self, rng: Box<dyn DeterministicRng + Send>) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Applies the configured jitter to `ttl`.
    pub fn apply_jitter(&self, ttl: Duration) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        apply_jitter(ttl, self.config.jitter_range, rng.as_mut())
    }

    /// Runs one cache call under the deadline. `Ok(None)` means the call
    /// failed and was downgraded under fail-open.
    async fn call<T>(
        &self,
        operation: &'static str,
        key: &str,
        call: impl Future<Output = Result<T, DomainError>>,
    ) -> Result<Option<T>, DomainError> {
        let result = match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::Cache(format!(
                "{operation} {key} timed out after {}ms",
                self.config.operation_timeout.as_millis()
            ))),
        };
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.config.fail_open => {
                warn!(operation, key, error = %err, "cache unavailable, bypassing");
                Ok(None)
            }
            Err(DomainError::Cache(message)) => Err(DomainError::Cache(message)),
            Err(err) => Err(DomainError::Cache(err.to_string())),
        }
    }

    /// Decodes a cached value for the read in `operation`. `None` is a miss.
    async fn lookup(&self, key: &str, operation: &Operation) -> Result<Option<OperationOutcome>, DomainError> {
        let Some(raw) = self.call("get", key, self.backend.get(key)).await?.flatten() else {
            return Ok(None);
        };
        let is_get = matches!(operation, Operation::Get { .. });
        if raw == NULL_MARKER {
            debug!(key, "negative cache hit");
            return Ok(Some(if is_get {
                OperationOutcome::Found(None)
            } else {
                OperationOutcome::Listed(Vec::new())
            }));
        }
        let decoded = if is_get {
            serde_json::from_str::<EntityRecord>(&raw).map(|r| OperationOutcome::Found(Some(r)))
        } else {
            serde_json::from_str::<Vec<EntityRecord>>(&raw).map(OperationOutcome::Listed)
        };
        match decoded {
            Ok(outcome) => {
                debug!(key, "cache hit");
                Ok(Some(outcome))
            }
            Err(err) => {
                warn!(key, error = %err, "dropping undecodable cache entry");
                self.call("delete", key, self.backend.delete(key)).await?;
                Ok(None)
            }
        }
    }

    async fn populate(&self, key: &str, outcome: &OperationOutcome) -> Result<(), DomainError> {
        let (value, ttl) = match outcome {
            empty if empty.is_empty_read() => {
                if !self.config.negative_caching {
                    return Ok(());
                }
                (NULL_MARKER.to_owned(), self.config.negative_ttl)
            }
            OperationOutcome::Found(Some(record)) => {
                (serde_json::to_string(record)?, self.apply_jitter(self.config.default_ttl))
            }
            OperationOutcome::Listed(records) => {
                (serde_json::to_string(records)?, self.apply_jitter(self.config.default_ttl))
            }
            _ => return Ok(()),
        };
        self.call("set", key, self.backend.set(key, &value, ttl)).await?;
        Ok(())
    }

    async fn read_through(
        &self,
        key: String,
        ctx: &mut OperationContext,
        next: Next<'_>,
    ) -> Result<OperationOutcome, DomainError> {
        if let Some(outcome) = self.lookup(&key, &ctx.operation).await? {
            return Ok(outcome);
        }
        let load = async {
            let outcome = next.run(ctx).await?;
            self.populate(&key, &outcome).await?;
            Ok::<_, DomainError>(outcome)
        };
        if self.config.single_flight {
            self.flight.execute(&key, load).await
        } else {
            load.await
        }
    }

    fn invalidation(&self, ctx: &OperationContext) -> Invalidation {
        let prefix = &self.config.key_prefix;
        let (id_keys, patterns) = if ctx.operation.is_batch() {
            (Vec::new(), vec![keys::type_prefix(prefix, &ctx.entity_type)])
        } else {
            (
                ctx.operation
                    .ids()
                    .into_iter()
                    .map(|id| keys::id_key(prefix, &ctx.entity_type, id))
                    .collect(),
                vec![keys::query_prefix(prefix, &ctx.entity_type)],
            )
        };
        Invalidation {
            backend: self.backend.clone(),
            timeout: self.config.operation_timeout,
            keys: id_keys,
            patterns,
        }
    }

    async fn invalidate(&self, invalidation: &Invalidation) -> Result<(), DomainError> {
        for key in &invalidation.keys {
            self.call("delete", key, self.backend.delete(key)).await?;
        }
        for pattern in &invalidation.patterns {
            self.call("delete_pattern", pattern, self.backend.delete_pattern(pattern))
                .await?;
        }
        Ok(())
    }
}

/// Keys dropped for one write. Applied when the write is staged and again
/// after the unit of work commits, so a read in between cannot leave the
/// old state cached.
struct Invalidation {
    backend: Arc<dyn CacheBackend>,
    timeout: Duration,
    keys: Vec<String>,
    patterns: Vec<String>,
}

impl Invalidation {
    async fn run<T>(
        &self,
        operation: &'static str,
        target: &str,
        call: impl Future<Output = Result<T, DomainError>>,
    ) {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::Cache(format!(
                "{operation} {target} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        };
        if let Err(err) = result {
            warn!(operation, key = target, error = %err, "post-commit invalidation failed");
        }
    }
}

#[async_trait]
impl AfterCommit for Invalidation {
    async fn after_commit(&self) {
        for key in &self.keys {
            self.run("delete", key, self.backend.delete(key)).await;
        }
        for pattern in &self.patterns {
            self.run("delete_pattern", pattern, self.backend.delete_pattern(pattern))
                .await;
        }
    }
}

#[async_trait]
impl Interceptor for CacheInterceptor {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn intercept(
        &self,
        ctx: &mut OperationContext,
        next: Next<'_>,
    ) -> Result<OperationOutcome, DomainError> {
        let prefix = &self.config.key_prefix;
        let read_key = match &ctx.operation {
            Operation::Get { id } => Some(keys::id_key(prefix, &ctx.entity_type, id)),
            Operation::Query(query) => Some(keys::query_key(prefix, &ctx.entity_type, query)?),
            _ => None,
        };
        match read_key {
            Some(key) => self.read_through(key, ctx, next).await,
            None => {
                let outcome = next.run(ctx).await?;
                let invalidation = self.invalidation(ctx);
                self.invalidate(&invalidation).await?;
                ctx.defer(Arc::new(invalidation));
                Ok(outcome)
            }
        }
    }
}
