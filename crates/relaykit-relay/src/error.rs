//! Relay daemon error types.

use relaykit_core::error::DomainError;
use thiserror::Error;

/// Startup and runtime errors for the relay daemon.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A relay component failed.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Signal handling or other I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
