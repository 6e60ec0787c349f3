//! # Murmur
//!
//! Realtime chat hub server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! murmur
//!
//! # Run with a config file in the working directory
//! cp murmur.example.toml murmur.toml && murmur
//!
//! # Run with environment variables
//! MURMUR_PORT=8080 MURMUR_HOST=0.0.0.0 murmur
//! ```

use anyhow::Result;
use murmur_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Murmur server on {}:{}", config.host, config.port);

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    handlers::run_server(config).await?;

    Ok(())
}
