//! Burrow tunnel client binary: connects, authenticates, and runs the local
//! HTTP proxy until interrupted.

use std::sync::Arc;

use anyhow::{bail, Result};
use burrow_client::proxy::LocalProxy;
use burrow_client::{ClientConfig, Tunnel};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = ClientConfig::from_env();
    let username = std::env::var("BURROW_USERNAME").unwrap_or_else(|_| "student".into());
    let password = std::env::var("BURROW_PASSWORD").unwrap_or_else(|_| "secure123".into());

    info!("==============================================");
    info!("   Burrow Tunnel Client v{}", env!("CARGO_PKG_VERSION"));
    info!("==============================================");
    info!("Server: {}", config.server_addr());
    info!("Proxy:  http://127.0.0.1:{}", config.proxy_port);
    info!("");

    let proxy_port = config.proxy_port;
    let tunnel = Arc::new(Tunnel::new(config));

    if let Err(e) = tunnel.connect(&username, &password).await {
        bail!("connect failed: {e}");
    }

    let proxy = Arc::new(LocalProxy::new(Arc::clone(&tunnel), proxy_port));
    let listener = proxy.bind().await?;
    let proxy_task = tokio::spawn(Arc::clone(&proxy).serve(listener));

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    proxy.shutdown();
    let _ = proxy_task.await;
    tunnel.disconnect().await;
    Ok(())
}
