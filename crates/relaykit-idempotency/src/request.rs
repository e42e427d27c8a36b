//! Request-side helpers: key header, validation, hashing.

use relaykit_core::error::DomainError;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "X-Idempotency-Key";

/// Header set on responses replayed from a stored record.
pub const IDEMPOTENCY_REPLAY_HEADER: &str = "X-Idempotency-Replay";

/// Longest accepted key, in characters.
pub const MAX_KEY_LEN: usize = 256;

/// Checks that a key is 1 to 256 characters long.
///
/// # Errors
///
/// Returns `DomainError::Validation` otherwise.
pub fn validate_key(key: &str) -> Result<(), DomainError> {
    let len = key.chars().count();
    if len == 0 || len > MAX_KEY_LEN {
        return Err(DomainError::Validation(format!(
            "idempotency key must be 1-{MAX_KEY_LEN} characters, got {len}"
        )));
    }
    Ok(())
}

/// Methods that take an idempotency key.
#[must_use]
pub fn is_idempotent_method(method: &str) -> bool {
    ["POST", "PUT", "PATCH", "DELETE"]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

/// Hex SHA-256 of `METHOD|path|body`.
#[must_use]
pub fn request_hash(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Operation name derived from a request: the lowercased method and the last
/// path segment that is not an id, e.g. `post_orders` for `POST /orders/{uuid}`.
#[must_use]
pub fn operation_name(method: &str, path: &str) -> String {
    let resource = path
        .trim_end_matches('/')
        .rsplit('/')
        .find(|segment| {
            !segment.is_empty()
                && Uuid::parse_str(segment).is_err()
                && !segment.bytes().all(|b| b.is_ascii_digit())
        })
        .unwrap_or("unknown");
    format!("{}_{resource}", method.to_ascii_lowercase())
}
