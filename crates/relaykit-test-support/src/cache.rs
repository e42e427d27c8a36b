//! Test caches: misbehaving `CacheBackend` implementations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relaykit_core::cache::CacheBackend;
use relaykit_core::error::DomainError;

/// A cache whose every call fails. Useful for fail-open/fail-closed tests.
#[derive(Debug, Default)]
pub struct FailingCache {
    calls: AtomicUsize,
}

impl FailingCache {
    /// Create a failing cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls made against the cache.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self) -> DomainError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DomainError::Cache("connection refused".into())
    }
}

#[async_trait]
impl CacheBackend for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, DomainError> {
        Err(self.fail())
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), DomainError> {
        Err(self.fail())
    }

    async fn delete(&self, _key: &str) -> Result<(), DomainError> {
        Err(self.fail())
    }

    async fn delete_pattern(&self, _prefix: &str) -> Result<u64, DomainError> {
        Err(self.fail())
    }
}

/// A cache that never answers within any reasonable deadline.
#[derive(Debug)]
pub struct HangingCache(pub Duration);

#[async_trait]
impl CacheBackend for HangingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, DomainError> {
        tokio::time::sleep(self.0).await;
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), DomainError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), DomainError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }

    async fn delete_pattern(&self, _prefix: &str) -> Result<u64, DomainError> {
        tokio::time::sleep(self.0).await;
        Ok(0)
    }
}
