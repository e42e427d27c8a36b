//! Relaykit Core: shared abstractions.
//!
//! This crate defines the event, aggregate, error and storage contracts that
//! the unit of work, repositories, cache, outbox relay and idempotency store
//! are built on. It contains no database or network code.

pub mod aggregate;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod outbox;
pub mod repository;
pub mod retry;
pub mod rng;
