//! # burrow-server
//!
//! The tunnel server: accepts TCP connections, drives the three-phase
//! handshake, and binds an authenticated dispatcher + flow controller to
//! each session.
//!
//! One task per accepted connection; each worker owns its socket and its
//! session key exclusively. The server itself holds only the shared bits:
//! the identity keypair, the session registry, and the global counters.

#![deny(unsafe_code)]

pub mod config;
mod dispatch;
mod session;
mod stats;

pub use config::ServerConfig;
pub use stats::ServerStats;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use burrow_crypto::ServerIdentity;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;

/// Cadence of the periodic statistics report.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Registry entry for one live session. The session key never appears here;
/// it is owned by the worker and zeroised when the worker exits.
#[derive(Clone, Debug)]
pub struct SessionEntry {
    /// Authenticated principal.
    pub username: String,
    /// When the handshake completed.
    pub connected_at: SystemTime,
}

/// The tunnel server.
///
/// Shared across tasks behind an [`Arc`]; [`TunnelServer::shutdown`] stops
/// the accept loop and every worker.
pub struct TunnelServer {
    config:   ServerConfig,
    identity: ServerIdentity,
    registry: Mutex<HashMap<SocketAddr, SessionEntry>>,
    stats:    ServerStats,
    shutdown: CancellationToken,
}

impl TunnelServer {
    /// Build a server: generates the process-lifetime RSA-2048 identity.
    pub fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let identity = ServerIdentity::generate().context("RSA identity generation")?;
        Ok(Arc::new(Self {
            config,
            identity,
            registry: Mutex::new(HashMap::new()),
            stats: ServerStats::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Bind the configured listen address with the configured backlog.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .with_context(|| format!("bad listen address {:?}", self.config.listen_addr()))?;
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(self.config.max_clients)?;
        log::info!("[server] Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Run the accept loop until [`TunnelServer::shutdown`] is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        log::info!("[server] Max clients: {}", self.config.max_clients);
        log::info!(
            "[server] Authentication: {}",
            if self.config.require_auth { "enabled" } else { "disabled" }
        );

        let reporter = tokio::spawn(Arc::clone(&self).report_loop());

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("[server] Accept failed: {e}");
                    continue;
                }
            };

            self.stats.connection_accepted();
            if self.session_count() >= self.config.max_clients as usize {
                log::warn!("[server] {peer} refused: session cap {} reached", self.config.max_clients);
                drop(stream);
                continue;
            }

            log::info!("[server] New connection from {peer}");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                session::run(server, stream, peer).await;
            });
        }

        log::info!("[server] Accept loop stopped");
        reporter.abort();
        Ok(())
    }

    /// Signal every task to stop. Workers close their sockets; session keys
    /// are dropped (zeroised) as the workers unwind.
    pub fn shutdown(&self) {
        log::info!("[server] Shutting down…");
        self.shutdown.cancel();
    }

    /// Number of live authenticated sessions.
    pub fn session_count(&self) -> usize {
        self.registry.lock().expect("registry lock poisoned").len()
    }

    /// Snapshot of the session registry.
    pub fn sessions(&self) -> Vec<(SocketAddr, SessionEntry)> {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .map(|(addr, entry)| (*addr, entry.clone()))
            .collect()
    }

    /// Process-wide counters.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn register(&self, peer: SocketAddr, username: &str) {
        let entry = SessionEntry {
            username: username.to_owned(),
            connected_at: SystemTime::now(),
        };
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .insert(peer, entry);
        self.stats.session_opened();
    }

    pub(crate) fn deregister(&self, peer: &SocketAddr) {
        if self.registry.lock().expect("registry lock poisoned").remove(peer).is_some() {
            self.stats.session_closed();
        }
    }

    /// Log a summary every [`REPORT_INTERVAL`] until shutdown.
    async fn report_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.tick().await; // immediate first tick carries no information
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let snapshot = self.stats.snapshot();
            log::info!(
                "[server] Uptime {:.0}s · {} total connections · {} active tunnels · {:.2} KB forwarded",
                snapshot.uptime_seconds,
                snapshot.total_connections,
                snapshot.active_tunnels,
                snapshot.total_bytes_forwarded as f64 / 1024.0,
            );
        }
    }
}
