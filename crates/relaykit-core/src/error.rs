//! Error taxonomy and the reason-code contract.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::retry::{ErrorClass, classify};

/// Coarse grouping used by callers to decide how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Business rule or invariant violations.
    Domain,
    /// Application-level coordination failures (idempotency, deferred delivery).
    Application,
    /// Database, cache and message bus failures.
    Infrastructure,
    /// Payloads that could not be encoded or decoded.
    Interface,
}

impl ErrorCategory {
    /// Returns the wire name of the category.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "DOMAIN",
            Self::Application => "APPLICATION",
            Self::Infrastructure => "INFRASTRUCTURE",
            Self::Interface => "INTERFACE",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type shared by every relaykit component.
///
/// The type is `Clone` so that a single in-flight result can be handed to
/// every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// An entity was not found.
    #[error("{entity_type} not found: {id}")]
    NotFound {
        /// The entity type name.
        entity_type: String,
        /// The requested identifier.
        id: String,
    },

    /// Optimistic concurrency conflict.
    #[error(
        "concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: String,
        /// The expected version.
        expected: i64,
        /// The actual version found.
        actual: i64,
    },

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// The idempotency key was reused with a different request payload.
    #[error("idempotency key {key} was already used for a different request")]
    IdempotencyConflict {
        /// The reused key.
        key: String,
    },

    /// A request with the same idempotency key is still being processed.
    #[error("request with idempotency key {key} is already in flight")]
    IdempotencyInFlight {
        /// The in-flight key.
        key: String,
    },

    /// The commit landed but the immediate publish gave up. The outbox relay
    /// will deliver the events.
    #[error("{event_count} event(s) committed but not yet published: {reason}")]
    PublishDeferred {
        /// Number of events left for the relay.
        event_count: usize,
        /// Last publish error.
        reason: String,
    },

    /// The message bus rejected or failed to deliver a publish.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The cache backend failed.
    #[error("cache error: {0}")]
    Cache(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DomainError {
    /// Returns the stable reason code for this error.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "ENTITY_NOT_FOUND",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::IdempotencyInFlight { .. } => "IDEMPOTENCY_IN_FLIGHT",
            Self::PublishDeferred { .. } => "OUTBOX_PUBLISH_DEFERRED",
            Self::Publish(_) => "PUBLISH_FAILED",
            Self::Cache(_) => "CACHE_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Infrastructure(_) => {
                if classify(self) == ErrorClass::Permanent {
                    "PERMANENT_INFRASTRUCTURE"
                } else {
                    "TRANSIENT_INFRASTRUCTURE"
                }
            }
            Self::Serialization(_) => "SERIALIZATION_FAILED",
        }
    }

    /// Returns the HTTP status an API layer should map this error to.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::ConcurrencyConflict { .. }
            | Self::IdempotencyConflict { .. }
            | Self::IdempotencyInFlight { .. } => 409,
            Self::Validation(_) => 400,
            Self::PublishDeferred { .. } => 202,
            Self::Publish(_) | Self::Cache(_) => 503,
            Self::Timeout(_) => 504,
            Self::Infrastructure(_) => {
                if self.retryable() {
                    503
                } else {
                    500
                }
            }
            Self::Serialization(_) => 422,
        }
    }

    /// Whether a caller may retry the same request later.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::IdempotencyInFlight { .. } => true,
            Self::Publish(_) | Self::Cache(_) | Self::Timeout(_) | Self::Infrastructure(_) => {
                classify(self).is_retryable()
            }
            _ => false,
        }
    }

    /// Returns the error category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } | Self::ConcurrencyConflict { .. } | Self::Validation(_) => {
                ErrorCategory::Domain
            }
            Self::IdempotencyConflict { .. }
            | Self::IdempotencyInFlight { .. }
            | Self::PublishDeferred { .. } => ErrorCategory::Application,
            Self::Publish(_) | Self::Cache(_) | Self::Timeout(_) | Self::Infrastructure(_) => {
                ErrorCategory::Infrastructure
            }
            Self::Serialization(_) => ErrorCategory::Interface,
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_conflict_is_domain_409_not_retryable() {
        let err = DomainError::ConcurrencyConflict {
            aggregate_id: "A-1".into(),
            expected: 1,
            actual: 2,
        };

        assert_eq!(err.reason_code(), "CONCURRENCY_CONFLICT");
        assert_eq!(err.http_status(), 409);
        assert!(!err.retryable());
        assert_eq!(err.category(), ErrorCategory::Domain);
    }

    #[test]
    fn test_validation_maps_to_400() {
        let err = DomainError::Validation("bad input".into());

        assert_eq!(err.http_status(), 400);
        assert_eq!(err.reason_code(), "VALIDATION_FAILED");
        assert!(!err.retryable());
    }

    #[test]
    fn test_transient_infrastructure_is_retryable_503() {
        let err = DomainError::Infrastructure("[SQLSTATE 40P01] deadlock detected".into());

        assert_eq!(err.reason_code(), "TRANSIENT_INFRASTRUCTURE");
        assert_eq!(err.http_status(), 503);
        assert!(err.retryable());
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
    }

    #[test]
    fn test_permanent_infrastructure_is_not_retryable_500() {
        let err =
            DomainError::Infrastructure("[SQLSTATE 42P01] relation \"orders\" does not exist".into());

        assert_eq!(err.reason_code(), "PERMANENT_INFRASTRUCTURE");
        assert_eq!(err.http_status(), 500);
        assert!(!err.retryable());
    }

    #[test]
    fn test_idempotency_errors_are_application_category() {
        let conflict = DomainError::IdempotencyConflict { key: "K".into() };
        let in_flight = DomainError::IdempotencyInFlight { key: "K".into() };

        assert_eq!(conflict.category(), ErrorCategory::Application);
        assert!(!conflict.retryable());
        assert_eq!(in_flight.category(), ErrorCategory::Application);
        assert!(in_flight.retryable());
    }

    #[test]
    fn test_serde_json_error_converts_to_interface_error() {
        let err: DomainError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();

        assert_eq!(err.category(), ErrorCategory::Interface);
        assert_eq!(err.http_status(), 422);
    }

    #[test]
    fn test_category_serializes_as_screaming_snake() {
        let json = serde_json::to_string(&ErrorCategory::Infrastructure).unwrap();
        assert_eq!(json, "\"INFRASTRUCTURE\"");
        assert_eq!(ErrorCategory::Domain.to_string(), "DOMAIN");
    }
}
