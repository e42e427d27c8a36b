//! Error classification and retry with exponential backoff.
//!
//! Infrastructure adapters keep the driver's SQLSTATE in the error message as
//! `[SQLSTATE xxxxx]`; classification pattern-matches on that tag and on
//! well-known driver phrases.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use crate::error::DomainError;
use crate::rng::DeterministicRng;

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Deadlocks, serialization failures, resource exhaustion.
    Transient,
    /// The operation exceeded a deadline.
    Timeout,
    /// The connection was lost or could not be established.
    Connection,
    /// Never succeeds on retry.
    Permanent,
}

impl ErrorClass {
    /// Whether errors of this class may be retried locally.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

const PERMANENT_SQLSTATES: &[&str] = &["42501", "42601", "42P01", "42703", "23502", "23503"];
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "53300", "55P03"];
const TIMEOUT_SQLSTATES: &[&str] = &["57014"];

const PERMANENT_PATTERNS: &[&str] = &[
    "permission denied",
    "syntax error",
    "does not exist",
    "violates not-null",
    "violates foreign key",
];
const CONNECTION_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "server closed the connection",
    "could not connect",
];
const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "canceling statement"];
const TRANSIENT_PATTERNS: &[&str] = &[
    "deadlock",
    "could not serialize",
    "serialization failure",
    "too many connections",
    "lock not available",
    "try again",
];

/// Extracts the SQLSTATE tag from an adapter error message, if present.
fn sqlstate(message: &str) -> Option<&str> {
    let start = message.find("[SQLSTATE ")? + "[SQLSTATE ".len();
    let rest = &message[start..];
    let end = rest.find(']')?;
    Some(&rest[..end])
}

fn classify_infrastructure(message: &str) -> ErrorClass {
    if let Some(code) = sqlstate(message) {
        if PERMANENT_SQLSTATES.contains(&code) {
            return ErrorClass::Permanent;
        }
        if TRANSIENT_SQLSTATES.contains(&code) {
            return ErrorClass::Transient;
        }
        if TIMEOUT_SQLSTATES.contains(&code) {
            return ErrorClass::Timeout;
        }
        if code.starts_with("08") {
            return ErrorClass::Connection;
        }
    }

    let lowered = message.to_lowercase();
    let matches_any = |patterns: &[&str]| patterns.iter().any(|p| lowered.contains(p));

    if matches_any(PERMANENT_PATTERNS) {
        ErrorClass::Permanent
    } else if matches_any(CONNECTION_PATTERNS) {
        ErrorClass::Connection
    } else if matches_any(TIMEOUT_PATTERNS) {
        ErrorClass::Timeout
    } else if matches_any(TRANSIENT_PATTERNS) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Classifies an error for retry purposes.
#[must_use]
pub fn classify(err: &DomainError) -> ErrorClass {
    match err {
        DomainError::Infrastructure(message) => classify_infrastructure(message),
        DomainError::Timeout(_) => ErrorClass::Timeout,
        DomainError::Publish(_) | DomainError::Cache(_) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Add up to half of each delay again, at random. The capped delay is
    /// never shortened.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs a single attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to sleep after the failed attempt number `attempt` (zero-based):
    /// `min(base * 2^attempt, max_delay)`, stretched by a factor in
    /// `[1.0, 1.5]` when jitter is on.
    pub fn delay_for(&self, attempt: u32, rng: &mut dyn DeterministicRng) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay));
        if self.jitter {
            delay.mul_f64(1.0 + rng.next_f64().clamp(0.0, 1.0) * 0.5)
        } else {
            delay
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. Returns the last error on exhaustion.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last retryable one once
/// `max_attempts` is reached.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    rng: &Mutex<Box<dyn DeterministicRng + Send>>,
    operation: &str,
    mut op: F,
) -> Result<T, DomainError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                if !class.is_retryable() || attempt + 1 >= max_attempts {
                    return Err(err);
                }
                let delay = {
                    let mut rng = rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    policy.delay_for(attempt, rng.as_mut())
                };
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    class = ?class,
                    error = %err,
                    "retrying after retryable error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
