//! Redis implementation of the `CacheBackend` trait.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use tracing::debug;

use relaykit_core::cache::CacheBackend;
use relaykit_core::error::DomainError;

use crate::error::cache_error;

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

/// Escapes glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Redis-backed cache.
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connects to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Cache` if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, DomainError> {
        let client = Client::open(redis_url).map_err(|e| cache_error("open redis client", &e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| cache_error("connect to redis", &e))?;
        Ok(Self { conn })
    }

    /// Wraps an existing connection.
    #[must_use]
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, DomainError> {
        let mut conn = self.conn.clone();
        let value: RedisResult<Option<String>> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        value.map_err(|e| cache_error("cache get", &e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DomainError> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await;
        result.map_err(|e| cache_error("cache set", &e))
    }

    async fn delete(&self, key: &str) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        result.map_err(|e| cache_error("cache delete", &e))
    }

    async fn delete_pattern(&self, prefix: &str) -> Result<u64, DomainError> {
        let pattern = format!("{}*", glob_escape(prefix));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| cache_error("cache scan", &e))?;

            if !keys.is_empty() {
                let removed: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| cache_error("cache delete", &e))?;
                deleted += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix, deleted, "cache prefix invalidated");
        Ok(deleted)
    }
}
