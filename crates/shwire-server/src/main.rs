//! shwire server binary
//!
//! Speaks the packet protocol on stdin/stdout. Logs go to stderr so they
//! never mix with frames.

use anyhow::{Context, Result};
use shwire_server::{Server, ServerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    info!("Starting shwire server {}", env!("CARGO_PKG_VERSION"));

    let server = Server::new(ServerConfig::from_env());
    server
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Server loop failed")?;

    info!("Server shutting down");
    Ok(())
}
