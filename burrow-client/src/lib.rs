//! # burrow-client
//!
//! Async client for the burrow tunnel:
//! - secure connect (RSA key exchange → AES session → credential check)
//! - one-shot forwarding of application payloads through the server
//! - server statistics requests
//! - background keepalive task
//! - a local HTTP proxy that multiplexes browser traffic into the tunnel
//!   ([`proxy::LocalProxy`])

#![deny(unsafe_code)]

mod config;
pub mod proxy;

pub use config::ClientConfig;
pub use burrow_proto::handshake::AuthGrant;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use burrow_crypto::{SessionKey, decrypt, encrypt};
use burrow_proto::framing::{FrameError, FramedStream};
use burrow_proto::handshake::{self, Credentials, HandshakeError};
use burrow_proto::wire::{ForwardReply, Keepalive, StatsSnapshot, STATUS_SUCCESS};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ─── Error ───────────────────────────────────────────────────────────────────

/// The error type returned from any [`Tunnel`] method.
#[derive(Debug)]
pub enum ClientError {
    /// No session is established.
    NotConnected,
    /// A session is already established; disconnect first.
    AlreadyConnected,
    /// Network / socket failure.
    Io(io::Error),
    /// Record framing failure.
    Frame(FrameError),
    /// Handshake failure, including credential rejection.
    Handshake(HandshakeError),
    /// The handshake did not complete within the configured timeout.
    Timeout,
    /// The server reply could not be decrypted or parsed.
    Protocol(String),
    /// The server reported a forwarding failure.
    Forward(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected     => write!(f, "not connected to the tunnel"),
            Self::AlreadyConnected => write!(f, "already connected; disconnect first"),
            Self::Io(e)            => write!(f, "I/O error: {e}"),
            Self::Frame(e)         => write!(f, "{e}"),
            Self::Handshake(e)     => write!(f, "{e}"),
            Self::Timeout          => write!(f, "handshake timed out"),
            Self::Protocol(s)      => write!(f, "protocol error: {s}"),
            Self::Forward(s)       => write!(f, "forward failed: {s}"),
        }
    }
}
impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}
impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self { Self::Frame(e) }
}
impl From<HandshakeError> for ClientError {
    fn from(e: HandshakeError) -> Self { Self::Handshake(e) }
}

// ─── Stats ───────────────────────────────────────────────────────────────────

/// Local per-connection counters.
#[derive(Clone, Debug, Default)]
pub struct ClientStats {
    /// Encrypted bytes written to the tunnel.
    pub bytes_sent: u64,
    /// Encrypted bytes read from the tunnel.
    pub bytes_received: u64,
    /// Records sent.
    pub packets_sent: u64,
    /// Records received.
    pub packets_received: u64,
    /// RTT of the most recent exchange.
    pub last_rtt: Duration,
    /// When the current session was established.
    pub connected_at: Option<Instant>,
}

// ─── Tunnel ──────────────────────────────────────────────────────────────────

/// An established session's socket and key. Dropping it closes the socket
/// and zeroises the key.
struct Conn {
    stream: FramedStream,
    key:    SessionKey,
}

struct KeepaliveTask {
    token:  CancellationToken,
    handle: JoinHandle<()>,
}

/// The tunnel client. Cheap to share behind an [`Arc`]; all methods take
/// `&self`.
pub struct Tunnel {
    config:    ClientConfig,
    conn:      Arc<AsyncMutex<Option<Conn>>>,
    stats:     Arc<std::sync::Mutex<ClientStats>>,
    keepalive: std::sync::Mutex<Option<KeepaliveTask>>,
    connected: AtomicBool,
}

impl Tunnel {
    /// Build a client for `config`. No connection is made yet.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            conn: Arc::new(AsyncMutex::new(None)),
            stats: Arc::new(std::sync::Mutex::new(ClientStats::default())),
            keepalive: std::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Connect and authenticate. On success the background keepalive task
    /// starts and the grant (server message + capabilities) is returned.
    pub async fn connect(&self, username: &str, password: &str) -> Result<AuthGrant, ClientError> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let addr = self.config.server_addr();
        log::info!("[client] Connecting to {addr}…");
        let credentials = Credentials::new(username, password);

        let establish = async {
            let mut stream = FramedStream::connect(&addr).await?;
            let pem = stream.recv().await?;
            let (hello, key) = handshake::start(&pem, &credentials)?;
            stream.send(&hello.wrapped_key).await?;
            stream.send(&hello.auth_record).await?;
            let response = stream.recv().await?;
            let grant = handshake::finish(&key, &response)?;
            Ok::<_, ClientError>((grant, Conn { stream, key }))
        };
        let (grant, conn) = timeout(self.config.connect_timeout, establish)
            .await
            .map_err(|_| ClientError::Timeout)??;

        *slot = Some(conn);
        drop(slot);
        {
            let mut stats = self.lock_stats();
            *stats = ClientStats::default();
            stats.connected_at = Some(Instant::now());
        }
        self.connected.store(true, Ordering::SeqCst);
        self.spawn_keepalive();

        log::info!("[client] ✓ Tunnel up: {}", grant.message);
        log::info!(
            "[client]   features: {} · cipher: {} · key exchange: {}",
            grant.server_info.features.join(", "),
            grant.server_info.encryption,
            grant.server_info.key_exchange,
        );
        Ok(grant)
    }

    /// Tear the session down: stops the keepalive task, closes the socket,
    /// zeroises the key, and logs a session summary.
    pub async fn disconnect(&self) {
        let task = self.keepalive.lock().expect("keepalive lock poisoned").take();
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }

        let closed = self.conn.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if closed.is_some() {
            let stats = self.lock_stats().clone();
            if let Some(connected_at) = stats.connected_at {
                log::info!(
                    "[client] Session closed after {:.1}s · {} records out / {} in · {} B out / {} B in",
                    connected_at.elapsed().as_secs_f64(),
                    stats.packets_sent,
                    stats.packets_received,
                    stats.bytes_sent,
                    stats.bytes_received,
                );
            }
        }
    }

    /// Whether a session is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send one plaintext record and await the reply. Returns the parsed
    /// reply JSON and the round-trip time, measured from the start of
    /// encryption to the reply being fully decrypted.
    pub async fn send(&self, plaintext: &str) -> Result<(Value, Duration), ClientError> {
        let mut slot = self.conn.lock().await;
        let conn = slot.as_mut().ok_or(ClientError::NotConnected)?;
        exchange(conn, &self.stats, plaintext).await
    }

    /// One-shot forward of `payload` to `host:port` through the server.
    ///
    /// `Ok` carries the success reply; use [`ForwardReply::data_bytes`] for
    /// the exact upstream bytes. A server-side forwarding failure surfaces
    /// as [`ClientError::Forward`]; the session stays usable.
    pub async fn forward(
        &self,
        host: &str,
        port: u16,
        payload: &str,
    ) -> Result<ForwardReply, ClientError> {
        let request = format!("FORWARD:{host}:{port}:{payload}");
        let (value, rtt) = self.send(&request).await?;
        let reply: ForwardReply = serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("forward reply: {e}")))?;

        if reply.status == STATUS_SUCCESS {
            log::info!(
                "[client] ✓ Forwarded to {host}:{port} (RTT {:.2} ms)",
                rtt.as_secs_f64() * 1000.0
            );
            Ok(reply)
        } else {
            let error = reply.error.unwrap_or_else(|| "unknown error".into());
            log::warn!("[client] ✗ Forward to {host}:{port} failed: {error}");
            Err(ClientError::Forward(error))
        }
    }

    /// Request the server's statistics snapshot.
    pub async fn request_statistics(&self) -> Result<StatsSnapshot, ClientError> {
        let (value, _) = self.send("STATS_REQ").await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("stats reply: {e}")))
    }

    /// Local counters for the current session.
    pub fn stats(&self) -> ClientStats {
        self.lock_stats().clone()
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, ClientStats> {
        self.stats.lock().expect("stats lock poisoned")
    }

    fn spawn_keepalive(&self) {
        let token = CancellationToken::new();
        let child = token.clone();
        let conn = Arc::clone(&self.conn);
        let stats = Arc::clone(&self.stats);
        let interval = self.config.keepalive_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let mut slot = conn.lock().await;
                let Some(conn) = slot.as_mut() else { break };

                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("system clock before Unix epoch")
                    .as_secs_f64();
                let body = serde_json::to_string(&Keepalive::at(now))
                    .expect("keepalive serialises");
                match exchange(conn, &stats, &body).await {
                    Ok(_) => log::debug!("[client] ♥ Keepalive acked"),
                    Err(e) => log::warn!("[client] Keepalive failed: {e}"),
                }
            }
        });

        *self.keepalive.lock().expect("keepalive lock poisoned") =
            Some(KeepaliveTask { token, handle });
    }
}

/// Encrypt-send-receive-decrypt one record pair, updating the counters.
///
/// Callers hold the connection lock, so the send and the matching reply are
/// never interleaved with another exchange.
async fn exchange(
    conn: &mut Conn,
    stats: &std::sync::Mutex<ClientStats>,
    plaintext: &str,
) -> Result<(Value, Duration), ClientError> {
    let started = Instant::now();

    let record = encrypt(plaintext.as_bytes(), &conn.key);
    conn.stream.send(&record).await?;
    {
        let mut stats = stats.lock().expect("stats lock poisoned");
        stats.bytes_sent += record.len() as u64;
        stats.packets_sent += 1;
    }

    let reply = conn.stream.recv().await?;
    let plain = decrypt(&reply, &conn.key)
        .map_err(|e| ClientError::Protocol(format!("reply decrypt: {e}")))?;
    let value: Value = serde_json::from_slice(&plain)
        .map_err(|e| ClientError::Protocol(format!("reply is not JSON: {e}")))?;

    let rtt = started.elapsed();
    {
        let mut stats = stats.lock().expect("stats lock poisoned");
        stats.bytes_received += reply.len() as u64;
        stats.packets_received += 1;
        stats.last_rtt = rtt;
    }
    Ok((value, rtt))
}
