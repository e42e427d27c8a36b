//! Database schema.
//!
//! The DDL lives in the workspace `migrations/` directory and is embedded
//! here so binaries and tests apply the same schema.

use sqlx::migrate::Migrator;

/// Generic entity document table.
pub const ENTITIES_TABLE: &str = "entities";

/// Transactional outbox table.
pub const OUTBOX_TABLE: &str = "outbox";

/// Idempotency key table.
pub const IDEMPOTENCY_TABLE: &str = "idempotency_records";

/// Embedded migrations.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
