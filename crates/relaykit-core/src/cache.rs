//! Cache backend protocol.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DomainError;

/// Key/value cache shared by every request in the process.
///
/// Values are opaque strings (serialized JSON). Implementations do not apply
/// timeouts; callers wrap each call in their own deadline.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value, `None` on miss or expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, DomainError>;

    /// Store a value for `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DomainError>;

    /// Remove one key.
    async fn delete(&self, key: &str) -> Result<(), DomainError>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    async fn delete_pattern(&self, prefix: &str) -> Result<u64, DomainError>;
}
