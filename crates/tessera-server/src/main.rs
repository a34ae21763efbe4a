//! # Tessera Server
//!
//! Realtime synchronization server for shared resources.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (reads ./tessera.toml when present)
//! TESSERA_JWT_SECRET=... tessera
//!
//! # Run with environment variables
//! TESSERA_PORT=8080 TESSERA_HOST=0.0.0.0 TESSERA_JWT_SECRET=... tessera
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Tessera server on {}:{}", config.host, config.port);

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    handlers::run_server(config).await?;

    Ok(())
}
