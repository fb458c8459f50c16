//! # Courier
//!
//! Real-time direct-messaging relay server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run against a specific database and port
//! COURIER_DB=/var/lib/courier/courier.db COURIER_PORT=9000 courier
//! ```
//!
//! Settings can also come from a `courier.toml` file; see `config`.

use anyhow::Result;
use courier_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;
    tracing::info!("Starting Courier relay on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await
}
