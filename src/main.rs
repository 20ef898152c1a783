mod config;
mod handler;
mod header;
mod relay;
mod server;

use crate::config::{Cli, RelayConfig};
use crate::server::Server;
use clap::Parser;
use color_eyre::eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wsrelay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = RelayConfig::from_cli(args)?;

    let server = Arc::new(Server::bind(config).await?);
    info!("Listening on {}", server.local_addr()?);

    tokio::spawn(Arc::clone(&server).run());

    signal::ctrl_c().await?;
    info!("Shutting down...");
    server.close();

    // Give the cancelled connections a moment to tear down cleanly.
    for _ in 0..50 {
        if server.active_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("Shutdown complete");

    Ok(())
}
