//! Idempotency keys for mutating requests.
//!
//! A client retrying a request with the same key gets the first response
//! back instead of running the operation twice. The same key sent with a
//! different request is rejected.

pub mod request;
pub mod store;

pub use request::{
    IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_REPLAY_HEADER, MAX_KEY_LEN, is_idempotent_method,
    operation_name, request_hash, validate_key,
};
pub use store::{IdempotencyConfig, IdempotencyStore, IdempotentResponse, LockOutcome};
