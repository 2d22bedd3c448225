//! The in-session request dispatcher.
//!
//! Reads one encrypted record at a time, classifies it, services it, and
//! frames the reply back — strictly FIFO: the reply to record *k* is written
//! before record *k+1* is read. `CONNECT` suspends classification and turns
//! the session into a full-duplex splice until either side closes.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_crypto::{SessionKey, decrypt, encrypt};
use burrow_proto::command::Command;
use burrow_proto::flow::FlowController;
use burrow_proto::framing::{FrameError, FramedStream};
use burrow_proto::wire::{Ack, ConnectReply, ForwardReply, KeepaliveAck, StatsSnapshot, TunnelStats};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::TunnelServer;

/// Deadline for upstream connects and reads in FORWARD mode.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
/// One-shot upstream read size in FORWARD mode.
const BUFFER_SIZE: usize = 4096;

/// Server-side request dispatcher bound to one authenticated session.
pub(crate) struct Dispatcher {
    server:       Arc<TunnelServer>,
    stream:       FramedStream,
    key:          SessionKey,
    peer:         SocketAddr,
    username:     String,
    flow:         FlowController,
    tunnel_stats: TunnelStats,
}

impl Dispatcher {
    pub(crate) fn new(
        server: Arc<TunnelServer>,
        stream: FramedStream,
        key: SessionKey,
        peer: SocketAddr,
        username: String,
    ) -> Self {
        Self {
            server,
            stream,
            key,
            peer,
            username,
            flow: FlowController::new(),
            tunnel_stats: TunnelStats::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        let peer = self.peer;
        let shutdown = self.server.shutdown_token().clone();
        log::debug!("[{peer}] Dispatching for '{}'", self.username);

        loop {
            let record = tokio::select! {
                _ = shutdown.cancelled() => break,
                record = self.stream.recv() => record,
            };
            let record = match record {
                Ok(record) => record,
                Err(FrameError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    log::info!("[{peer}] Peer closed the tunnel");
                    break;
                }
                Err(FrameError::Oversize { len }) => {
                    log::warn!("[{peer}] Oversize record ({len} bytes declared), terminating session");
                    break;
                }
                Err(e) => {
                    log::warn!("[{peer}] Receive failed: {e}");
                    break;
                }
            };

            let received_at = Instant::now();

            // A record that fails to decrypt is logged and skipped: transient
            // framing drift must not cost the whole session.
            let plaintext = match decrypt(&record, &self.key) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    log::warn!("[{peer}] Record decrypt failed ({} bytes): {e}", record.len());
                    continue;
                }
            };
            let text = match String::from_utf8(plaintext) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("[{peer}] Record is not UTF-8: {e}");
                    continue;
                }
            };

            let done = match Command::parse(&text) {
                Ok(Command::Keepalive) => {
                    log::debug!("[{peer}] Keepalive");
                    !self.reply(&KeepaliveAck::default(), received_at).await
                }
                Ok(Command::StatsRequest) => {
                    let snapshot = StatsSnapshot {
                        tunnel_stats:       self.tunnel_stats.clone(),
                        flow_control_stats: self.flow.snapshot(),
                        server_stats:       self.server.stats().snapshot(),
                    };
                    !self.reply(&snapshot, received_at).await
                }
                Ok(Command::Forward { host, port, payload }) => {
                    let reply = self.forward(&host, port, &payload).await;
                    !self.reply(&reply, received_at).await
                }
                Ok(Command::Connect { host, port }) => {
                    match self.connect_upstream(&host, port).await {
                        Ok(upstream) => {
                            if self.reply(&ConnectReply::ok(), received_at).await {
                                return self.splice(upstream).await;
                            }
                            true
                        }
                        Err(reply) => !self.reply(&reply, received_at).await,
                    }
                }
                Ok(Command::Opaque(data)) => {
                    self.tunnel_stats.packets_received += 1;
                    !self.reply(&Ack::of_size(data.len()), received_at).await
                }
                Err(e) => {
                    log::warn!("[{peer}] Bad command: {e}");
                    !self.reply(&ForwardReply::failure(e.to_string()), received_at).await
                }
            };
            if done {
                break;
            }
        }
    }

    /// Encrypt, frame and send one reply; account it with the flow
    /// controller. Returns false when the connection is dead.
    async fn reply<T: Serialize>(&mut self, body: &T, received_at: Instant) -> bool {
        let json = serde_json::to_string(body).expect("reply serialises");
        let record = encrypt(json.as_bytes(), &self.key);

        if !self.flow.can_send(record.len()) {
            // Advisory only: the carrier is reliable TCP with its own
            // backpressure.
            log::debug!(
                "[{}] Congestion window full ({} bytes pending)",
                self.peer,
                record.len()
            );
        }

        match self.stream.send(&record).await {
            Ok(()) => {
                self.flow.on_packet_sent(record.len());
                self.flow.on_ack_received(record.len(), received_at.elapsed());
                true
            }
            Err(e) => {
                log::warn!("[{}] Reply send failed: {e}", self.peer);
                false
            }
        }
    }

    /// One-shot forward: connect, write the payload, read once, close.
    ///
    /// Both upstream waits are raced against the shutdown token so a stalled
    /// upstream cannot hold the worker past the shutdown bound.
    async fn forward(&mut self, host: &str, port: u16, payload: &str) -> ForwardReply {
        let addr = format!("{host}:{port}");
        log::debug!("[{}] FORWARD {addr}, {} payload bytes", self.peer, payload.len());
        let shutdown = self.server.shutdown_token().clone();

        let mut upstream = tokio::select! {
            _ = shutdown.cancelled() => return ForwardReply::failure("server shutting down"),
            connected = timeout(UPSTREAM_TIMEOUT, TcpStream::connect(&addr)) => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.flow.on_packet_loss();
                    return ForwardReply::failure(format!("connect to {addr}: {e}"));
                }
                Err(_) => {
                    self.flow.on_timeout();
                    return ForwardReply::failure(format!("connect to {addr} timed out"));
                }
            },
        };
        self.tunnel_stats.connections += 1;

        if !payload.is_empty() {
            if let Err(e) = upstream.write_all(payload.as_bytes()).await {
                self.flow.on_packet_loss();
                return ForwardReply::failure(format!("write to {addr}: {e}"));
            }
            self.tunnel_stats.bytes_sent += payload.len() as u64;
            self.tunnel_stats.packets_sent += 1;
            self.server.stats().add_forwarded(payload.len() as u64);
        }

        // An empty payload still means "connect and read".
        let mut buf = vec![0u8; BUFFER_SIZE];
        let n = tokio::select! {
            _ = shutdown.cancelled() => return ForwardReply::failure("server shutting down"),
            read = timeout(UPSTREAM_TIMEOUT, upstream.read(&mut buf)) => match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    self.flow.on_packet_loss();
                    return ForwardReply::failure(format!("read from {addr}: {e}"));
                }
                Err(_) => {
                    self.flow.on_timeout();
                    return ForwardReply::failure(format!("read from {addr} timed out"));
                }
            },
        };
        self.tunnel_stats.bytes_received += n as u64;
        self.tunnel_stats.packets_received += 1;
        self.server.stats().add_forwarded(n as u64);

        log::debug!("[{}] FORWARD {addr} returned {n} bytes", self.peer);
        ForwardReply::success(&buf[..n])
    }

    /// Open the upstream for CONNECT mode. The wait stops at shutdown like
    /// the FORWARD waits do.
    async fn connect_upstream(&self, host: &str, port: u16) -> Result<TcpStream, ConnectReply> {
        let addr = format!("{host}:{port}");
        let shutdown = self.server.shutdown_token().clone();
        tokio::select! {
            _ = shutdown.cancelled() => Err(ConnectReply::failure("server shutting down")),
            connected = timeout(UPSTREAM_TIMEOUT, TcpStream::connect(&addr)) => match connected {
                Ok(Ok(stream)) => {
                    log::info!("[{}] CONNECT {addr}: splice mode", self.peer);
                    Ok(stream)
                }
                Ok(Err(e)) => Err(ConnectReply::failure(format!("connect to {addr}: {e}"))),
                Err(_) => Err(ConnectReply::failure(format!("connect to {addr} timed out"))),
            },
        }
    }

    /// Full-duplex splice. Client→server records are decrypted and written
    /// upstream raw; upstream bytes are encrypted into records. Both halves
    /// stop together on either side closing, and the session ends with them.
    async fn splice(self, upstream: TcpStream) {
        let Dispatcher { server, stream, key, peer, .. } = self;
        let (mut client_r, mut client_w) = stream.into_split();
        let (mut up_r, mut up_w) = upstream.into_split();
        let shutdown = server.shutdown_token().clone();

        let client_to_upstream = async {
            loop {
                let record = match client_r.recv().await {
                    Ok(record) => record,
                    Err(_) => break,
                };
                let plain = match decrypt(&record, &key) {
                    Ok(plain) => plain,
                    Err(e) => {
                        log::warn!("[{peer}] Splice decrypt failed: {e}");
                        break;
                    }
                };
                if up_w.write_all(&plain).await.is_err() {
                    break;
                }
                server.stats().add_forwarded(plain.len() as u64);
            }
        };

        let upstream_to_client = async {
            let mut buf = vec![0u8; BUFFER_SIZE];
            loop {
                let n = match up_r.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let record = encrypt(&buf[..n], &key);
                if client_w.send(&record).await.is_err() {
                    break;
                }
                server.stats().add_forwarded(n as u64);
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = client_to_upstream => {}
            _ = upstream_to_client => {}
        }
        log::info!("[{peer}] Splice ended");
    }
}
