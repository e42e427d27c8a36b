//! Relay configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use relaykit_outbox::ProjectorConfig;

use crate::error::RelayError;

/// Default stream events are appended to.
pub const DEFAULT_STREAM: &str = "relaykit:events";

/// Relay daemon settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// `PostgreSQL` connection string.
    pub database_url: String,
    /// Redis connection string.
    pub redis_url: String,
    /// Redis stream key.
    pub stream: String,
    /// Sleep between outbox polls.
    pub poll_interval: Duration,
    /// Outbox rows per poll.
    pub batch_size: u32,
    /// Publish failures tolerated before a row is dead-lettered.
    pub max_retries: i32,
    /// Interval of the housekeeping pass.
    pub cleanup_interval: Duration,
    /// How long `SENT` outbox rows are kept.
    pub sent_retention: Duration,
    /// Pool size.
    pub max_connections: u32,
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, RelayError> {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| RelayError::Config(format!("{name} environment variable must be set")))
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, RelayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RelayError::Config(format!("{name} is invalid ({raw:?}): {e}"))),
        None => Ok(default),
    }
}

fn positive<T: PartialOrd + Default>(name: &str, value: T) -> Result<T, RelayError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(RelayError::Config(format!("{name} must be greater than zero")))
    }
}

impl RelayConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` if a required variable is missing or a
    /// value does not parse.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` if a required variable is missing or a
    /// value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayError> {
        let poll_ms = positive(
            "RELAY_POLL_INTERVAL_MS",
            parsed(&lookup, "RELAY_POLL_INTERVAL_MS", 1000_u64)?,
        )?;
        let cleanup_secs = positive(
            "IDEMPOTENCY_CLEANUP_INTERVAL_SECS",
            parsed(&lookup, "IDEMPOTENCY_CLEANUP_INTERVAL_SECS", 3600_u64)?,
        )?;
        let retention_hours = parsed(&lookup, "RELAY_SENT_RETENTION_HOURS", 168_u64)?;
        let max_retries = parsed(&lookup, "RELAY_MAX_RETRIES", 5_i32)?;
        if max_retries < 0 {
            return Err(RelayError::Config(
                "RELAY_MAX_RETRIES must not be negative".into(),
            ));
        }

        Ok(Self {
            database_url: required(&lookup, "DATABASE_URL")?,
            redis_url: required(&lookup, "REDIS_URL")?,
            stream: lookup("RELAY_STREAM")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_STREAM.to_string()),
            poll_interval: Duration::from_millis(poll_ms),
            batch_size: positive("RELAY_BATCH_SIZE", parsed(&lookup, "RELAY_BATCH_SIZE", 100_u32)?)?,
            max_retries,
            cleanup_interval: Duration::from_secs(cleanup_secs),
            sent_retention: Duration::from_secs(retention_hours.saturating_mul(3600)),
            max_connections: positive(
                "DATABASE_MAX_CONNECTIONS",
                parsed(&lookup, "DATABASE_MAX_CONNECTIONS", 10_u32)?,
            )?,
        })
    }

    /// Projector settings derived from this configuration.
    #[must_use]
    pub fn projector_config(&self) -> ProjectorConfig {
        ProjectorConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_batch_size(self.batch_size)
            .with_max_retries(self.max_retries)
    }
}
