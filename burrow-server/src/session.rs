//! Per-connection worker: handshake, then dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use burrow_proto::framing::FramedStream;
use burrow_proto::handshake::{self, AuthOutcome, CredentialOracle};
use burrow_proto::wire::ServerInfo;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::dispatch::Dispatcher;
use crate::TunnelServer;

/// Oracle used when `require_auth` is off.
struct AllowAny;

impl CredentialOracle for AllowAny {
    fn check(&self, _username: &str, _password: &str) -> bool {
        true
    }
}

/// Drive one accepted connection to completion.
pub(crate) async fn run(server: Arc<TunnelServer>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        log::warn!("[{peer}] set_nodelay failed: {e}");
    }
    let stream = FramedStream::from_stream(stream);

    // The connection timeout applies until AUTHENTICATED; afterwards the
    // session is long-lived with application-layer keepalives.
    let deadline = server.config().connect_timeout;
    // `handshake_phase` registers the session just before it sends the
    // grant, so every failure path here must also clean the registry up.
    let authenticated = match timeout(deadline, handshake_phase(&server, stream, peer)).await {
        Ok(Ok(Some(pair))) => pair,
        Ok(Ok(None)) => return, // rejected, response already sent
        Ok(Err(e)) => {
            server.deregister(&peer);
            log::warn!("[{peer}] Handshake failed: {e}");
            return;
        }
        Err(_) => {
            server.deregister(&peer);
            log::warn!("[{peer}] Handshake timed out after {deadline:?}");
            return;
        }
    };
    let (stream, key, username) = authenticated;

    log::info!("[{peer}] Authenticated as '{username}', tunnel established");

    Dispatcher::new(Arc::clone(&server), stream, key, peer, username).run().await;

    server.deregister(&peer);
    log::info!("[{peer}] Disconnected");
}

/// The four ordered handshake frames. `Ok(None)` means the credentials were
/// rejected and the connection must close.
async fn handshake_phase(
    server: &TunnelServer,
    mut stream: FramedStream,
    peer: SocketAddr,
) -> anyhow::Result<Option<(FramedStream, burrow_crypto::SessionKey, String)>> {
    // 1. Public key out
    let pem = handshake::offer(server.identity())?;
    stream.send(&pem).await?;
    log::debug!("[{peer}] Sent RSA public key");

    // 2. Wrapped session key in
    let wrapped = stream.recv().await?;
    let key = handshake::accept_session_key(server.identity(), &wrapped)?;
    log::debug!("[{peer}] Session key unwrapped");

    // 3. Credentials in, 4. response out
    let auth_record = stream.recv().await?;
    let config = server.config();
    let allow_any = AllowAny;
    let oracle: &dyn CredentialOracle = if config.require_auth {
        &config.credentials
    } else {
        &allow_any
    };
    let server_info = ServerInfo {
        server_ip: Some(config.host.clone()),
        ..ServerInfo::default()
    };

    match handshake::verify_credentials(&key, &auth_record, oracle, server_info) {
        AuthOutcome::Granted { username, response_record } => {
            // Register before the grant leaves the socket: a client holding
            // its grant must always find its session in the registry.
            server.register(peer, &username);
            stream.send(&response_record).await?;
            Ok(Some((stream, key, username)))
        }
        AuthOutcome::Rejected { response_record } => {
            stream.send(&response_record).await?;
            log::warn!("[{peer}] Authentication failed");
            Ok(None)
        }
    }
}
