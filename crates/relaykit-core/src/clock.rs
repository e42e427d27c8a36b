//! Wall-clock access and TTL arithmetic.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::DomainError;

/// Source of timestamps for `created_at`, `sent_at` and expiry checks.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Reads `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Converts a configured TTL or retention window into a `chrono` span.
///
/// # Errors
///
/// Returns `DomainError::Validation` if `span` is too large to add to a
/// timestamp.
pub fn span(span: Duration) -> Result<chrono::Duration, DomainError> {
    chrono::Duration::from_std(span)
        .map_err(|e| DomainError::Validation(format!("duration {span:?} out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_converts_whole_and_fractional_seconds() {
        assert_eq!(span(Duration::from_secs(90)).unwrap(), chrono::Duration::seconds(90));
        assert_eq!(
            span(Duration::from_millis(1500)).unwrap(),
            chrono::Duration::milliseconds(1500)
        );
    }

    #[test]
    fn test_span_rejects_unrepresentable_durations() {
        assert!(matches!(span(Duration::MAX), Err(DomainError::Validation(_))));
    }
}
