//! Driver error mapping.
//!
//! Database errors keep their SQLSTATE in the message as `[SQLSTATE xxxxx]`
//! so `relaykit_core::retry::classify` can tell transient from permanent.

use relaykit_core::error::DomainError;

/// Maps a `sqlx` error raised while doing `context`. Socket failures are
/// tagged with the connection-failure class `08006`.
pub fn db_error(context: &str, err: sqlx::Error) -> DomainError {
    match err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => {
                DomainError::Infrastructure(format!("[SQLSTATE {code}] {context}: {}", db.message()))
            }
            None => DomainError::Infrastructure(format!("{context}: {}", db.message())),
        },
        sqlx::Error::PoolTimedOut => {
            DomainError::Timeout(format!("{context}: timed out waiting for a connection"))
        }
        sqlx::Error::PoolClosed => {
            DomainError::Infrastructure(format!("[SQLSTATE 08003] {context}: pool is closed"))
        }
        sqlx::Error::Io(e) => {
            DomainError::Infrastructure(format!("[SQLSTATE 08006] {context}: connection failure: {e}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            DomainError::Serialization(format!("{context}: {err}"))
        }
        other => DomainError::Infrastructure(format!("{context}: {other}")),
    }
}

/// Whether `err` is a unique-key violation.
#[must_use]
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Maps a Redis error raised by the cache.
pub fn cache_error(context: &str, err: &redis::RedisError) -> DomainError {
    if err.is_timeout() {
        DomainError::Timeout(format!("{context}: {err}"))
    } else {
        DomainError::Cache(format!("{context}: {err}"))
    }
}

/// Maps a Redis error raised by the bus.
pub fn bus_error(context: &str, err: &redis::RedisError) -> DomainError {
    DomainError::Publish(format!("{context}: {err}"))
}
