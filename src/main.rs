//! Cadastre - municipal parcel record reconciliation and matching system.
//!
//! A batch tool for reconciling per-region property records from geometry,
//! authoritative, and supplemental sources into one deduplicated store.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadastre::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "cadastre=info"
    } else {
        "cadastre=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    cli::run().await
}
