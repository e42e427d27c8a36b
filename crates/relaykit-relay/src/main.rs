//! relaykit outbox relay entry point.

use relaykit_relay::{RelayConfig, RelayError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting relaykit outbox relay");

    let config = RelayConfig::from_env()?;
    relaykit_relay::run(config).await
}
