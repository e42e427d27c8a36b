//! PostgreSQL and Redis adapters.
//!
//! `sqlx` backs the entity store, the outbox and the idempotency records;
//! Redis backs the cache and the message bus. Driver errors are mapped into
//! `DomainError` with enough detail for the retry classifier.

pub mod error;
pub mod pg_entity_store;
pub mod pg_idempotency_repository;
pub mod pg_outbox_repository;
pub mod redis_cache;
pub mod redis_stream_bus;
pub mod schema;

pub use pg_entity_store::PgEntityStore;
pub use pg_idempotency_repository::PgIdempotencyRepository;
pub use pg_outbox_repository::PgOutboxRepository;
pub use redis_cache::RedisCache;
pub use redis_stream_bus::RedisStreamBus;
