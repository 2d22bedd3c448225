//! Local HTTP proxy.
//!
//! Listens on loopback, accepts ordinary browser requests (absolute-URI
//! proxy form or origin form + `Host` header), rewrites the request line to
//! path-only, and relays the request through [`Tunnel::forward`]. The
//! upstream bytes from the reply are returned to the browser verbatim.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::Tunnel;

/// Deadline for reading the browser's request head.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Request size cap.
const MAX_REQUEST: usize = 100 * 1024;

const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\
\r\n\
<h1>Tunnel Error</h1><p>Could not forward the request through the tunnel.</p>";

/// Where a browser request should go, plus the rewritten request text.
#[derive(Debug, PartialEq)]
struct ProxyTarget {
    host:    String,
    port:    u16,
    request: String,
}

/// The local HTTP proxy bound to one [`Tunnel`].
pub struct LocalProxy {
    tunnel:   Arc<Tunnel>,
    port:     u16,
    shutdown: CancellationToken,
}

impl LocalProxy {
    /// Build a proxy that forwards through `tunnel`.
    pub fn new(tunnel: Arc<Tunnel>, port: u16) -> Self {
        Self { tunnel, port, shutdown: CancellationToken::new() }
    }

    /// Bind the loopback listener.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await?;
        log::info!(
            "[proxy] Listening on http://{} — point your browser at it",
            listener.local_addr()?
        );
        Ok(listener)
    }

    /// Accept browser connections until [`LocalProxy::shutdown`].
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    let tunnel = Arc::clone(&self.tunnel);
                    tokio::spawn(handle_browser(tunnel, socket, peer));
                }
                Err(e) => log::error!("[proxy] Accept failed: {e}"),
            }
        }
        log::info!("[proxy] Stopped");
    }

    /// Stop the accept loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn handle_browser(tunnel: Arc<Tunnel>, mut socket: TcpStream, peer: SocketAddr) {
    let request = match timeout(REQUEST_TIMEOUT, read_request_head(&mut socket)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            log::warn!("[proxy] {peer}: read failed: {e}");
            return;
        }
        Err(_) => {
            log::warn!("[proxy] {peer}: timed out reading request");
            return;
        }
    };

    let Some(target) = parse_target(&request) else {
        log::warn!("[proxy] {peer}: no destination in request");
        let _ = socket.write_all(BAD_GATEWAY).await;
        return;
    };
    log::info!("[proxy] {peer} → {}:{} through the tunnel", target.host, target.port);

    match tunnel.forward(&target.host, target.port, &target.request).await {
        Ok(reply) => {
            let body = reply.data_bytes().unwrap_or_default();
            if let Err(e) = socket.write_all(&body).await {
                log::warn!("[proxy] {peer}: write-back failed: {e}");
            } else {
                log::debug!("[proxy] {peer}: relayed {} bytes", body.len());
            }
        }
        Err(e) => {
            log::warn!("[proxy] {peer}: tunnel forward failed: {e}");
            let _ = socket.write_all(BAD_GATEWAY).await;
        }
    }
}

/// Read until the end of the header block (or the size cap).
async fn read_request_head(socket: &mut TcpStream) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() < MAX_REQUEST {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    if buf.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Work out the upstream destination and rewrite the request line to
/// path-only form. Returns `None` when neither the request line nor the
/// headers name a destination.
fn parse_target(request: &str) -> Option<ProxyTarget> {
    let (first_line, rest) = request.split_once("\r\n")?;
    let mut parts = first_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;

    let (host, port, path) = if let Some(stripped) = target.strip_prefix("http://") {
        let (authority, path) = split_authority(stripped);
        let (host, port) = split_host_port(authority, 80)?;
        (host, port, path)
    } else if let Some(stripped) = target.strip_prefix("https://") {
        let (authority, path) = split_authority(stripped);
        let (host, port) = split_host_port(authority, 443)?;
        (host, port, path)
    } else {
        // Origin form: the Host header names the destination.
        let host_value = rest
            .split("\r\n")
            .take_while(|line| !line.is_empty())
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("host").then(|| value.trim())
            })?;
        let (host, port) = split_host_port(host_value, 80)?;
        (host, port, target.to_string())
    };

    Some(ProxyTarget {
        host,
        port,
        request: format!("{method} {path} HTTP/1.1\r\n{rest}"),
    })
}

/// Split `host[:port]/path…` into the authority and the path (`/` default).
fn split_authority(rest: &str) -> (&str, String) {
    match rest.split_once('/') {
        Some((authority, path)) => (authority, format!("/{path}")),
        None => (rest, "/".to_string()),
    }
}

/// Split `host[:port]`; an unparsable port falls back to the default.
fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port_text)) => {
            let port = port_text.parse().unwrap_or(default_port);
            Some((host.to_string(), port))
        }
        None => Some((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_uri_with_port() {
        let target = parse_target(
            "GET http://10.0.0.5:9000/files/a.txt HTTP/1.1\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.port, 9000);
        assert!(target.request.starts_with("GET /files/a.txt HTTP/1.1\r\n"));
        assert!(target.request.contains("Accept: */*"));
    }

    #[test]
    fn absolute_uri_default_ports() {
        let http = parse_target("GET http://example.com/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!((http.host.as_str(), http.port), ("example.com", 80));

        let https = parse_target("GET https://example.com HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!((https.host.as_str(), https.port), ("example.com", 443));
        assert!(https.request.starts_with("GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn origin_form_uses_host_header() {
        let target = parse_target(
            "POST /login HTTP/1.1\r\nhost: intranet:8081\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(target.host, "intranet");
        assert_eq!(target.port, 8081);
        assert!(target.request.starts_with("POST /login HTTP/1.1\r\n"));
    }

    #[test]
    fn origin_form_without_host_header_is_rejected() {
        assert!(parse_target("GET /x HTTP/1.1\r\nAccept: */*\r\n\r\n").is_none());
    }

    #[test]
    fn host_header_without_port_defaults_to_80() {
        let target = parse_target("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!((target.host.as_str(), target.port), ("example.com", 80));
    }

    #[test]
    fn body_after_headers_is_preserved() {
        let target = parse_target(
            "POST http://h:81/x HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd",
        )
        .unwrap();
        assert!(target.request.ends_with("\r\n\r\nabcd"));
    }
}
