//! Wire JSON schemas.
//!
//! Every plaintext that crosses the tunnel in JSON form has exactly one
//! schema type here — replies are never shaped ad hoc at the call site.

use serde::{Deserialize, Serialize};

/// `status` value for success replies.
pub const STATUS_SUCCESS: &str = "success";
/// `status` value for error replies.
pub const STATUS_ERROR: &str = "error";

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Credentials JSON carried in handshake step 3 (encrypted).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Principal name.
    pub username: String,
    /// Shared secret.
    pub password: String,
    /// Seconds since the Unix epoch. Accepted without replay checking.
    pub timestamp: f64,
    /// Client software version string.
    pub client_version: String,
}

/// Server capabilities advertised in a successful auth response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Enabled feature names.
    pub features: Vec<String>,
    /// Record cipher name.
    pub encryption: String,
    /// Key-exchange scheme name.
    pub key_exchange: String,
    /// Listen address, when the server chooses to disclose it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            features: vec![
                "tunneling".into(),
                "flow_control".into(),
                "encryption".into(),
            ],
            encryption: "AES-256-CBC".into(),
            key_exchange: "RSA-2048-OAEP".into(),
            server_ip: None,
        }
    }
}

/// Auth response JSON carried in handshake step 4 (encrypted).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    /// `"success"` or `"error"`.
    pub status: String,
    /// Human-readable outcome, surfaced to the user.
    pub message: String,
    /// Present on success only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

// ─── In-session messages ─────────────────────────────────────────────────────

/// Application keepalive sent by the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Keepalive {
    /// Always `"keepalive"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Seconds since the Unix epoch at send time.
    pub timestamp: f64,
}

impl Keepalive {
    /// Build a keepalive stamped `now`.
    pub fn at(timestamp: f64) -> Self {
        Self { kind: "keepalive".into(), timestamp }
    }
}

/// Reply to a keepalive: `{"status":"ok","type":"keepalive_ack"}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepaliveAck {
    /// Always `"ok"`.
    pub status: String,
    /// Always `"keepalive_ack"`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for KeepaliveAck {
    fn default() -> Self {
        Self { status: "ok".into(), kind: "keepalive_ack".into() }
    }
}

/// Reply to an opaque data record: `{"status":"ack","size":N}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ack {
    /// Always `"ack"`.
    pub status: String,
    /// Plaintext length of the acknowledged record.
    pub size: usize,
}

impl Ack {
    /// Acknowledge `size` plaintext bytes.
    pub fn of_size(size: usize) -> Self {
        Self { status: "ack".into(), size }
    }
}

/// Reply to a `FORWARD:` request.
///
/// On success `data` holds the upstream bytes Latin-1-decoded so arbitrary
/// bytes survive JSON; decoders must re-encode with Latin-1 to recover them
/// exactly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardReply {
    /// `"success"` or `"error"`.
    pub status: String,
    /// Upstream response bytes, Latin-1-decoded. Success only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Failure description. Error only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForwardReply {
    /// Success reply carrying the upstream bytes.
    pub fn success(upstream: &[u8]) -> Self {
        Self {
            status: STATUS_SUCCESS.into(),
            data: Some(latin1_to_string(upstream)),
            error: None,
        }
    }

    /// Error reply with a failure description.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.into(),
            data: None,
            error: Some(message.into()),
        }
    }

    /// Recover the exact upstream bytes from a success reply.
    pub fn data_bytes(&self) -> Option<Vec<u8>> {
        self.data.as_deref().map(string_to_latin1)
    }
}

/// Reply to a `CONNECT:` request before splice mode begins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectReply {
    /// `"success"` or `"error"`.
    pub status: String,
    /// Always `"connect_ok"` on success.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Failure description. Error only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectReply {
    /// Splice mode is about to begin.
    pub fn ok() -> Self {
        Self {
            status: STATUS_SUCCESS.into(),
            kind: Some("connect_ok".into()),
            error: None,
        }
    }

    /// Upstream connect failed.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.into(),
            kind: None,
            error: Some(message.into()),
        }
    }
}

// ─── Statistics ──────────────────────────────────────────────────────────────

/// Per-session forwarding counters kept by the dispatcher.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TunnelStats {
    /// Bytes written to upstreams.
    pub bytes_sent: u64,
    /// Bytes read back from upstreams.
    pub bytes_received: u64,
    /// Upstream writes performed.
    pub packets_sent: u64,
    /// Upstream reads performed.
    pub packets_received: u64,
    /// Upstream connections opened.
    pub connections: u64,
}

/// Snapshot of the flow controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowStats {
    /// Congestion window, bytes.
    pub cwnd: u64,
    /// Slow-start threshold, bytes.
    pub ssthresh: u64,
    /// Whether the controller is in slow start.
    pub in_slow_start: bool,
    /// Unacked packet count.
    pub packets_in_flight: u64,
    /// Total packets sent.
    pub total_sent: u64,
    /// Total packets acked.
    pub total_acked: u64,
    /// Loss events observed.
    pub retransmissions: u64,
    /// Mean of the RTT sample window, milliseconds.
    pub avg_rtt_ms: f64,
    /// Smoothed RTT, milliseconds.
    pub smoothed_rtt_ms: f64,
    /// Mean throughput over the sample window, megabits per second.
    pub avg_throughput_mbps: f64,
    /// `packets_in_flight · 1024 / cwnd`.
    pub window_utilization: f64,
}

/// Process-wide server counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerStatsSnapshot {
    /// Connections accepted since start.
    pub total_connections: u64,
    /// Sessions currently authenticated.
    pub active_tunnels: u64,
    /// Bytes forwarded to upstreams since start.
    pub total_bytes_forwarded: u64,
    /// Seconds since the server started.
    pub uptime_seconds: f64,
}

/// Full stats reply to `STATS_REQ` / `{"type":"stats_request"}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Per-session forwarding counters.
    pub tunnel_stats: TunnelStats,
    /// Flow controller snapshot.
    pub flow_control_stats: FlowStats,
    /// Process-wide counters.
    pub server_stats: ServerStatsSnapshot,
}

// ─── Latin-1 byte transport ──────────────────────────────────────────────────

/// Decode arbitrary bytes into a JSON-safe string, one char per byte.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Re-encode a Latin-1-decoded string back to its exact bytes.
///
/// Chars above U+00FF cannot come from [`latin1_to_string`] and are mapped
/// to `?`.
pub fn string_to_latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_roundtrips_every_byte_value() {
        let bytes: Vec<u8> = (0..=255).collect();
        let s = latin1_to_string(&bytes);
        assert_eq!(string_to_latin1(&s), bytes);
        // And survives a JSON trip, which is the point
        let json = serde_json::to_string(&s).unwrap();
        let back: String = serde_json::from_str(&json).unwrap();
        assert_eq!(string_to_latin1(&back), bytes);
    }

    #[test]
    fn forward_reply_success_shape() {
        let json = serde_json::to_string(&ForwardReply::success(b"HELLO")).unwrap();
        assert_eq!(json, r#"{"status":"success","data":"HELLO"}"#);
    }

    #[test]
    fn forward_reply_error_shape() {
        let json = serde_json::to_string(&ForwardReply::failure("connection refused")).unwrap();
        assert_eq!(json, r#"{"status":"error","error":"connection refused"}"#);
    }

    #[test]
    fn auth_response_omits_absent_server_info() {
        let rejected = AuthResponse {
            status: STATUS_ERROR.into(),
            message: "Authentication failed: Invalid credentials".into(),
            server_info: None,
        };
        let json = serde_json::to_string(&rejected).unwrap();
        assert!(!json.contains("server_info"));
    }

    #[test]
    fn keepalive_ack_shape() {
        let json = serde_json::to_string(&KeepaliveAck::default()).unwrap();
        assert_eq!(json, r#"{"status":"ok","type":"keepalive_ack"}"#);
    }
}
