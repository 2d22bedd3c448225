//! Burrow tunnel server binary.

use std::sync::Arc;

use anyhow::Result;
use burrow_server::{ServerConfig, TunnelServer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = ServerConfig::from_env();

    info!("==============================================");
    info!("   Burrow Tunnel Server v{}", env!("CARGO_PKG_VERSION"));
    info!("==============================================");
    info!("Listen:         {}", config.listen_addr());
    info!("Encryption:     AES-256-CBC");
    info!("Key exchange:   RSA-2048-OAEP");
    info!("Max clients:    {}", config.max_clients);
    info!(
        "Authentication: {}",
        if config.require_auth { "enabled" } else { "disabled" }
    );
    info!("");

    info!("Generating RSA-2048 identity keypair…");
    let server = TunnelServer::new(config)?;
    info!("✓ Identity ready");

    let listener = server.bind().await?;

    // Ctrl-C reaches the server through this clone; no process-global needed.
    let on_signal = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.shutdown();
        }
    });

    server.serve(listener).await
}
