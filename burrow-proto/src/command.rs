//! Classification of in-session plaintext records.
//!
//! The dispatcher decides what a decrypted record means through exactly one
//! parser: JSON control messages first, then the literal command prefixes,
//! then opaque data.

use std::fmt;

use serde_json::Value;

// ─── Error ───────────────────────────────────────────────────────────────────

/// A record that names a command but fails to parse as one.
///
/// These are reported back to the client as error replies; the session is
/// preserved.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandError {
    /// A `FORWARD:`/`CONNECT:` port field that is not a valid u16.
    InvalidPort {
        /// The offending field text.
        given: String,
    },
    /// A `FORWARD:`/`CONNECT:` missing its host or port field.
    MissingField {
        /// The command prefix involved.
        command: &'static str,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort { given }    => write!(f, "invalid port: {given:?}"),
            Self::MissingField { command } => write!(f, "{command} request is missing host or port"),
        }
    }
}
impl std::error::Error for CommandError {}

// ─── Command ─────────────────────────────────────────────────────────────────

/// Everything a decrypted in-session record can mean.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// `{"type":"keepalive",…}` — answer with a keepalive ack.
    Keepalive,
    /// `{"type":"stats_request"}` or the literal `STATS_REQ`.
    StatsRequest,
    /// `FORWARD:<host>:<port>:<payload>` — one-shot upstream exchange.
    Forward {
        /// Upstream host.
        host: String,
        /// Upstream port.
        port: u16,
        /// Bytes to write upstream; may be empty and may contain colons.
        payload: String,
    },
    /// `CONNECT:<host>:<port>` — enter full-duplex splice mode.
    Connect {
        /// Upstream host.
        host: String,
        /// Upstream port.
        port: u16,
    },
    /// Anything else — acknowledged with `{"status":"ack","size":N}`.
    Opaque(String),
}

impl Command {
    /// Classify one decrypted plaintext record.
    pub fn parse(plaintext: &str) -> Result<Self, CommandError> {
        // JSON control messages take precedence; JSON of any other shape
        // falls through to the literal prefixes.
        if let Ok(value) = serde_json::from_str::<Value>(plaintext) {
            match value.get("type").and_then(Value::as_str) {
                Some("keepalive")     => return Ok(Self::Keepalive),
                Some("stats_request") => return Ok(Self::StatsRequest),
                _ => {}
            }
        }

        if let Some(rest) = plaintext.strip_prefix("FORWARD:") {
            return Self::parse_forward(rest);
        }
        if let Some(rest) = plaintext.strip_prefix("CONNECT:") {
            return Self::parse_connect(rest);
        }
        if plaintext.starts_with("STATS_REQ") {
            return Ok(Self::StatsRequest);
        }

        Ok(Self::Opaque(plaintext.to_owned()))
    }

    /// `<host>:<port>:<payload>` — the payload is everything after the third
    /// colon of the full command and may itself contain colons.
    fn parse_forward(rest: &str) -> Result<Self, CommandError> {
        let mut parts = rest.splitn(3, ':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or(CommandError::MissingField { command: "FORWARD" })?;
        let port_text = parts
            .next()
            .ok_or(CommandError::MissingField { command: "FORWARD" })?;
        let port = port_text
            .parse::<u16>()
            .map_err(|_| CommandError::InvalidPort { given: port_text.to_owned() })?;
        let payload = parts.next().unwrap_or("");
        Ok(Self::Forward {
            host: host.to_owned(),
            port,
            payload: payload.to_owned(),
        })
    }

    /// `<host>:<port>` — trailing colon-separated junk is ignored.
    fn parse_connect(rest: &str) -> Result<Self, CommandError> {
        let mut parts = rest.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or(CommandError::MissingField { command: "CONNECT" })?;
        let port_text = parts
            .next()
            .ok_or(CommandError::MissingField { command: "CONNECT" })?;
        let port = port_text
            .parse::<u16>()
            .map_err(|_| CommandError::InvalidPort { given: port_text.to_owned() })?;
        Ok(Self::Connect { host: host.to_owned(), port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_json() {
        let cmd = Command::parse(r#"{"type":"keepalive","timestamp":1723200000.5}"#).unwrap();
        assert_eq!(cmd, Command::Keepalive);
    }

    #[test]
    fn stats_request_json_and_literal() {
        assert_eq!(
            Command::parse(r#"{"type":"stats_request"}"#).unwrap(),
            Command::StatsRequest
        );
        assert_eq!(Command::parse("STATS_REQ").unwrap(), Command::StatsRequest);
    }

    #[test]
    fn forward_payload_keeps_its_colons() {
        let cmd = Command::parse("FORWARD:example.com:80:GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(
            cmd,
            Command::Forward {
                host: "example.com".into(),
                port: 80,
                payload: "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".into(),
            }
        );
    }

    #[test]
    fn forward_payload_may_be_empty() {
        assert_eq!(
            Command::parse("FORWARD:10.0.0.1:9000:").unwrap(),
            Command::Forward { host: "10.0.0.1".into(), port: 9000, payload: String::new() }
        );
        // No trailing colon at all still means "just connect and read"
        assert_eq!(
            Command::parse("FORWARD:10.0.0.1:9000").unwrap(),
            Command::Forward { host: "10.0.0.1".into(), port: 9000, payload: String::new() }
        );
    }

    #[test]
    fn forward_rejects_bad_port() {
        assert_eq!(
            Command::parse("FORWARD:host:http:payload"),
            Err(CommandError::InvalidPort { given: "http".into() })
        );
    }

    #[test]
    fn forward_rejects_missing_fields() {
        assert_eq!(
            Command::parse("FORWARD:"),
            Err(CommandError::MissingField { command: "FORWARD" })
        );
        assert_eq!(
            Command::parse("FORWARD:host"),
            Err(CommandError::MissingField { command: "FORWARD" })
        );
    }

    #[test]
    fn connect_parses_and_ignores_trailing_parts() {
        assert_eq!(
            Command::parse("CONNECT:db.internal:5432").unwrap(),
            Command::Connect { host: "db.internal".into(), port: 5432 }
        );
        assert_eq!(
            Command::parse("CONNECT:db.internal:5432:extra").unwrap(),
            Command::Connect { host: "db.internal".into(), port: 5432 }
        );
    }

    #[test]
    fn unknown_json_is_opaque() {
        let cmd = Command::parse(r#"{"type":"telemetry","x":1}"#).unwrap();
        assert_eq!(cmd, Command::Opaque(r#"{"type":"telemetry","x":1}"#.into()));
    }

    #[test]
    fn plain_text_is_opaque() {
        assert_eq!(
            Command::parse("hello tunnel").unwrap(),
            Command::Opaque("hello tunnel".into())
        );
    }
}
