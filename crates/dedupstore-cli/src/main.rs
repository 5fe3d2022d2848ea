use anyhow::Result;
use clap::Parser;
use dedupstore_cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::debug!("dedupstore starting");

    Cli::parse().run().await
}
