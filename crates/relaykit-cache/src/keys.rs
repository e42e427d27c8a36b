//! Cache key layout.
//!
//! Point lookups live under `{prefix}{EntityType}:id:{id}` and query results
//! under `{prefix}{EntityType}:query:{hash}`, so a write can drop every
//! query of a type with one prefix delete.

use relaykit_core::error::DomainError;
use relaykit_core::repository::Query;
use sha2::{Digest, Sha256};

/// Value stored for a lookup that found nothing.
pub const NULL_MARKER: &str = "__relaykit_null__";

/// Hex chars of the query hash kept in the key.
const QUERY_HASH_LEN: usize = 16;

/// Key of a point lookup.
#[must_use]
pub fn id_key(prefix: &str, entity_type: &str, id: &str) -> String {
    format!("{prefix}{entity_type}:id:{id}")
}

/// Prefix shared by every cached query of a type.
#[must_use]
pub fn query_prefix(prefix: &str, entity_type: &str) -> String {
    format!("{prefix}{entity_type}:query:")
}

/// Prefix shared by every key of a type.
#[must_use]
pub fn type_prefix(prefix: &str, entity_type: &str) -> String {
    format!("{prefix}{entity_type}:")
}

/// Key of a query result: the query prefix plus a truncated SHA-256 of the
/// query's canonical JSON.
///
/// # Errors
///
/// Returns `DomainError::Serialization` if the query cannot be encoded.
pub fn query_key(prefix: &str, entity_type: &str, query: &Query) -> Result<String, DomainError> {
    let canonical = serde_json::to_string(query)?;
    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    Ok(format!(
        "{}{}",
        query_prefix(prefix, entity_type),
        &digest[..QUERY_HASH_LEN]
    ))
}
