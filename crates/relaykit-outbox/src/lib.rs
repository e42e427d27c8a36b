//! Outbox relay.
//!
//! Rows committed by the unit of work but not confirmed as published are
//! picked up here and pushed to the bus until they are sent or run out of
//! retries.

pub mod projector;

pub use projector::{OutboxProjector, ProjectionPass, ProjectorConfig, ProjectorHandle};
