//! Read-through caching for repositories.
//!
//! [`CacheInterceptor`] sits first in an interceptor chain. Reads are served
//! from a [`CacheBackend`](relaykit_core::cache::CacheBackend) when possible;
//! misses load the origin once per key through [`SingleFlight`]; writes
//! invalidate the affected keys.

pub mod interceptor;
pub mod keys;
pub mod memory;
pub mod single_flight;

pub use interceptor::{CacheConfig, CacheInterceptor, apply_jitter};
pub use keys::NULL_MARKER;
pub use memory::InMemoryCache;
pub use single_flight::SingleFlight;
