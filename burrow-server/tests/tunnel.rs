//! End-to-end tunnel scenarios: a real server and a real client over
//! loopback, plus a hand-driven protocol client for the wire-level cases
//! the high-level API does not expose.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_client::{ClientConfig, ClientError, Tunnel};
use burrow_crypto::{decrypt, encrypt, SessionKey};
use burrow_proto::framing::{FramedStream, MAX_RECORD_LEN};
use burrow_proto::handshake::{self, Credentials, GRANTED_MESSAGE, REJECTED_MESSAGE, HandshakeError};
use burrow_server::{ServerConfig, TunnelServer};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

// ─── Harness ─────────────────────────────────────────────────────────────────

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    }
}

async fn start_server_with(
    config: ServerConfig,
) -> (Arc<TunnelServer>, SocketAddr, JoinHandle<anyhow::Result<()>>) {
    let server = TunnelServer::new(config).expect("server init");
    let listener = server.bind().await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(Arc::clone(&server).serve(listener));
    (server, addr, task)
}

async fn start_server() -> (Arc<TunnelServer>, SocketAddr, JoinHandle<anyhow::Result<()>>) {
    start_server_with(test_config()).await
}

fn client_for(addr: SocketAddr) -> Tunnel {
    Tunnel::new(ClientConfig {
        server_host: addr.ip().to_string(),
        server_port: addr.port(),
        ..ClientConfig::default()
    })
}

/// An upstream that replies with the first five bytes uppercased, then
/// closes.
async fn spawn_upper_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if let Ok(n) = socket.read(&mut buf).await {
                    let reply: Vec<u8> =
                        buf[..n.min(5)].iter().map(u8::to_ascii_uppercase).collect();
                    let _ = socket.write_all(&reply).await;
                }
            });
        }
    });
    addr
}

/// An upstream that echoes every byte back until the peer closes.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Drive the handshake by hand for wire-level tests.
async fn manual_session(addr: SocketAddr) -> (FramedStream, SessionKey) {
    let mut stream = FramedStream::connect(&addr.to_string()).await.unwrap();
    let pem = stream.recv().await.unwrap();
    let creds = Credentials::new("student", "secure123");
    let (hello, key) = handshake::start(&pem, &creds).unwrap();
    stream.send(&hello.wrapped_key).await.unwrap();
    stream.send(&hello.auth_record).await.unwrap();
    let response = stream.recv().await.unwrap();
    handshake::finish(&key, &response).unwrap();
    (stream, key)
}

async fn wait_for_session_count(server: &TunnelServer, expected: usize) {
    for _ in 0..30 {
        if server.session_count() == expected {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "registry never reached {expected} sessions (now {})",
        server.session_count()
    );
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn successful_handshake_registers_a_session() {
    let (server, addr, _task) = start_server().await;

    let tunnel = client_for(addr);
    let grant = tunnel.connect("student", "secure123").await.unwrap();

    assert_eq!(grant.message, GRANTED_MESSAGE);
    assert_eq!(grant.server_info.encryption, "AES-256-CBC");
    assert_eq!(grant.server_info.key_exchange, "RSA-2048-OAEP");
    for feature in ["tunneling", "flow_control", "encryption"] {
        assert!(grant.server_info.features.iter().any(|f| f == feature));
    }

    assert_eq!(server.session_count(), 1);
    let sessions = server.sessions();
    assert_eq!(sessions[0].1.username, "student");

    tunnel.disconnect().await;
    wait_for_session_count(&server, 0).await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_credentials_close_the_connection() {
    let (server, addr, _task) = start_server().await;

    let tunnel = client_for(addr);
    match tunnel.connect("student", "wrong").await {
        Err(ClientError::Handshake(HandshakeError::Rejected { message })) => {
            assert_eq!(message, REJECTED_MESSAGE);
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    assert_eq!(server.session_count(), 0);
    assert!(!tunnel.is_connected());
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_loopback_roundtrips_through_the_tunnel() {
    let (server, addr, _task) = start_server().await;
    let echo = spawn_upper_echo().await;

    let tunnel = client_for(addr);
    tunnel.connect("student", "secure123").await.unwrap();

    let reply = tunnel.forward("127.0.0.1", echo.port(), "hello").await.unwrap();
    assert_eq!(reply.status, "success");
    assert_eq!(reply.data_bytes().unwrap(), b"HELLO");

    let stats = tunnel.stats();
    assert!(stats.packets_sent >= 1);
    assert!(stats.packets_received >= 1);
    assert!(stats.bytes_sent > 0);
    assert!(stats.bytes_received > 0);

    tunnel.disconnect().await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_error_preserves_the_session() {
    let (server, addr, _task) = start_server().await;
    let echo = spawn_upper_echo().await;

    let tunnel = client_for(addr);
    tunnel.connect("student", "secure123").await.unwrap();

    // Nothing listens on port 1.
    match tunnel.forward("127.0.0.1", 1, "").await {
        Err(ClientError::Forward(error)) => assert!(!error.is_empty()),
        other => panic!("expected a forward error, got {other:?}"),
    }

    // The session survived and the next forward succeeds.
    assert_eq!(server.session_count(), 1);
    let reply = tunnel.forward("127.0.0.1", echo.port(), "again").await.unwrap();
    assert_eq!(reply.data_bytes().unwrap(), b"AGAIN");

    tunnel.disconnect().await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn keepalives_flow_and_keep_the_session_authenticated() {
    let (server, addr, _task) = start_server().await;

    let tunnel = Tunnel::new(ClientConfig {
        server_host: addr.ip().to_string(),
        server_port: addr.port(),
        keepalive_interval: Duration::from_millis(200),
        ..ClientConfig::default()
    });
    tunnel.connect("student", "secure123").await.unwrap();

    sleep(Duration::from_millis(1100)).await;

    // At least three keepalive/ack pairs went through the counters.
    let stats = tunnel.stats();
    assert!(stats.packets_sent >= 3, "only {} records sent", stats.packets_sent);
    assert!(stats.packets_received >= 3, "only {} records received", stats.packets_received);

    // Still authenticated and serving.
    assert_eq!(server.session_count(), 1);
    let (value, _) = tunnel.send("still here").await.unwrap();
    assert_eq!(value["status"], "ack");

    tunnel.disconnect().await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_accept_loop_and_workers_within_bound() {
    let (server, addr, task) = start_server().await;

    let tunnel = client_for(addr);
    tunnel.connect("student", "secure123").await.unwrap();
    assert_eq!(server.session_count(), 1);

    server.shutdown();

    let served = timeout(Duration::from_millis(1500), task)
        .await
        .expect("accept loop must exit within 1.5s")
        .expect("serve task must not panic");
    served.unwrap();

    wait_for_session_count(&server, 0).await;

    // The worker closed the socket; the session is gone for the client too.
    assert!(tunnel.send("anyone there?").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_preempts_a_blocked_forward() {
    let (server, addr, task) = start_server().await;

    // An upstream that accepts and then never sends a byte, parking the
    // worker inside the FORWARD upstream read.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let _hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = silent.accept().await {
            held.push(socket);
        }
    });

    let tunnel = Arc::new(client_for(addr));
    tunnel.connect("student", "secure123").await.unwrap();

    let forwarding = tokio::spawn({
        let tunnel = Arc::clone(&tunnel);
        async move { tunnel.forward("127.0.0.1", silent_addr.port(), "stall").await }
    });
    sleep(Duration::from_millis(300)).await;

    server.shutdown();

    let served = timeout(Duration::from_millis(1500), task)
        .await
        .expect("accept loop must exit within 1.5s despite the stalled forward")
        .expect("serve task must not panic");
    served.unwrap();
    wait_for_session_count(&server, 0).await;

    // The parked forward came back as a failure, not a hang.
    let result = timeout(Duration::from_millis(1500), forwarding)
        .await
        .expect("forward must be preempted by shutdown")
        .unwrap();
    assert!(result.is_err());
}

// ─── Wire-level cases ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn opaque_records_are_acked_with_their_size() {
    let (server, addr, _task) = start_server().await;

    let tunnel = client_for(addr);
    tunnel.connect("student", "secure123").await.unwrap();

    let (value, _) = tunnel.send("hello tunnel").await.unwrap();
    assert_eq!(value["status"], "ack");
    assert_eq!(value["size"], "hello tunnel".len());

    tunnel.disconnect().await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_forward_port_gets_an_error_reply_not_a_teardown() {
    let (server, addr, _task) = start_server().await;
    let echo = spawn_upper_echo().await;

    let tunnel = client_for(addr);
    tunnel.connect("student", "secure123").await.unwrap();

    let (value, _) = tunnel.send("FORWARD:somehost:http:payload").await.unwrap();
    assert_eq!(value["status"], "error");

    let reply = tunnel.forward("127.0.0.1", echo.port(), "hello").await.unwrap();
    assert_eq!(reply.data_bytes().unwrap(), b"HELLO");

    tunnel.disconnect().await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_snapshot_reports_all_three_sections() {
    let (server, addr, _task) = start_server().await;
    let echo = spawn_upper_echo().await;

    let tunnel = client_for(addr);
    tunnel.connect("student", "secure123").await.unwrap();
    tunnel.forward("127.0.0.1", echo.port(), "hello").await.unwrap();

    let snapshot = tunnel.request_statistics().await.unwrap();
    assert_eq!(snapshot.tunnel_stats.connections, 1);
    assert_eq!(snapshot.tunnel_stats.bytes_sent, 5);
    assert_eq!(snapshot.tunnel_stats.bytes_received, 5);
    // The dispatcher accounts every reply it sends.
    assert!(snapshot.flow_control_stats.total_sent >= 1);
    assert_eq!(
        snapshot.flow_control_stats.total_sent,
        snapshot.flow_control_stats.total_acked
    );
    assert!(snapshot.flow_control_stats.cwnd >= 4096);
    assert_eq!(snapshot.server_stats.active_tunnels, 1);
    assert!(snapshot.server_stats.total_connections >= 1);
    assert!(snapshot.server_stats.total_bytes_forwarded >= 10);

    tunnel.disconnect().await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversize_record_terminates_the_session() {
    let (server, addr, _task) = start_server().await;

    let (stream, _key) = manual_session(addr).await;
    wait_for_session_count(&server, 1).await;

    let mut raw = stream.into_inner();
    let declared = (MAX_RECORD_LEN + 1) as u32;
    raw.write_all(&declared.to_be_bytes()).await.unwrap();

    // The server must close without waiting for a payload that never comes.
    let mut probe = [0u8; 1];
    let n = timeout(Duration::from_secs(2), raw.read(&mut probe))
        .await
        .expect("server must close the session promptly")
        .unwrap();
    assert_eq!(n, 0, "expected EOF from the server");

    wait_for_session_count(&server, 0).await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn undecryptable_record_is_skipped_not_fatal() {
    let (server, addr, _task) = start_server().await;

    let (mut stream, key) = manual_session(addr).await;

    // 32 bytes that were never encrypted under the session key.
    stream.send(&[0xABu8; 32]).await.unwrap();

    // The session must still classify and ack the next record.
    stream.send(&encrypt(b"ping", &key)).await.unwrap();
    let reply = decrypt(&stream.recv().await.unwrap(), &key).unwrap();
    let value: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(value["status"], "ack");
    assert_eq!(value["size"], 4);

    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_mode_splices_bytes_transparently() {
    let (server, addr, _task) = start_server().await;
    let echo = spawn_echo().await;

    let (mut stream, key) = manual_session(addr).await;

    let request = format!("CONNECT:127.0.0.1:{}", echo.port());
    stream.send(&encrypt(request.as_bytes(), &key)).await.unwrap();
    let reply = decrypt(&stream.recv().await.unwrap(), &key).unwrap();
    let value: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(value["status"], "success");
    assert_eq!(value["type"], "connect_ok");

    // Arbitrary bytes — including ones that are not UTF-8 — must round-trip
    // exactly through the splice.
    let payload = [0u8, 1, 2, 0xFF, 0xFE, 77, 13, 10];
    stream.send(&encrypt(&payload, &key)).await.unwrap();
    let record = timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("echo must come back")
        .unwrap();
    assert_eq!(decrypt(&record, &key).unwrap(), payload);

    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn session_cap_refuses_extra_connections() {
    let (server, addr, _task) = start_server_with(ServerConfig {
        max_clients: 1,
        ..test_config()
    })
    .await;

    let first = client_for(addr);
    first.connect("student", "secure123").await.unwrap();
    assert_eq!(server.session_count(), 1);

    let second = client_for(addr);
    assert!(second.connect("student", "secure123").await.is_err());
    assert_eq!(server.session_count(), 1);

    first.disconnect().await;
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_can_be_disabled() {
    let (server, addr, _task) = start_server_with(ServerConfig {
        require_auth: false,
        ..test_config()
    })
    .await;

    let tunnel = client_for(addr);
    let grant = tunnel.connect("whoever", "whatever").await.unwrap();
    assert_eq!(grant.message, GRANTED_MESSAGE);
    assert_eq!(server.session_count(), 1);

    tunnel.disconnect().await;
    server.shutdown();
}
