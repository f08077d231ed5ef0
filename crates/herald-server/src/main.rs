//! # Herald Server
//!
//! Pushes targeted events and presence rosters to HTTP clients over
//! server-sent event streams.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Override settings with environment variables
//! HERALD_PORT=8080 HERALD_HOST=0.0.0.0 herald
//! HERALD_BROKER__DELIVERY_TIMEOUT_MS=500 herald
//! ```

mod config;
mod handlers;
mod metrics;
mod sessions;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_server=debug,herald_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Herald server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
