//! Outbox relay daemon.
//!
//! Connects to `PostgreSQL` and Redis, applies migrations, then runs the
//! outbox projector and the housekeeping loop until interrupted.

pub mod config;
pub mod error;
pub mod housekeeping;

use std::sync::Arc;

use relaykit_idempotency::{IdempotencyConfig, IdempotencyStore};
use relaykit_outbox::OutboxProjector;
use relaykit_store::schema::MIGRATOR;
use relaykit_store::{PgIdempotencyRepository, PgOutboxRepository, RedisStreamBus};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::info;

pub use config::RelayConfig;
pub use error::RelayError;
pub use housekeeping::{Housekeeper, HousekeepingPass};

/// Runs the relay until Ctrl-C, then drains and returns.
///
/// # Errors
///
/// Returns `RelayError` if the database or Redis is unreachable, migrations
/// fail, or a worker task dies.
pub async fn run(config: RelayConfig) -> Result<(), RelayError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    MIGRATOR.run(&pool).await?;
    info!("database migrations applied");

    let bus = RedisStreamBus::connect(&config.redis_url, config.stream.clone()).await?;
    info!(stream = %bus.stream(), "connected to redis");

    let projector = Arc::new(OutboxProjector::new(
        Arc::new(PgOutboxRepository::new(pool.clone())),
        Arc::new(bus),
        config.projector_config(),
    ));
    let idempotency = Arc::new(IdempotencyStore::new(
        Arc::new(PgIdempotencyRepository::new(pool.clone())),
        IdempotencyConfig::default(),
    ));
    let housekeeper = Housekeeper::new(
        idempotency,
        projector.clone(),
        config.cleanup_interval,
        config.sent_retention,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let housekeeping = tokio::spawn(async move { housekeeper.run_until(stop_rx).await });
    let relay = projector.spawn();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    stop_tx.send_replace(true);
    relay.shutdown().await?;
    housekeeping
        .await
        .map_err(|e| RelayError::Io(std::io::Error::other(e)))?;
    pool.close().await;

    info!("relay stopped");
    Ok(())
}
