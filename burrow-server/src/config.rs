//! Server configuration.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Tunable server settings. `Default` gives the stock deployment; every
/// field can be overridden from the environment via [`ServerConfig::from_env`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address (`BURROW_HOST`).
    pub host: String,
    /// Listen port (`BURROW_PORT`). Port 0 picks an ephemeral port.
    pub port: u16,
    /// Listen backlog and soft cap on active sessions (`BURROW_MAX_CLIENTS`).
    pub max_clients: u32,
    /// When false, any credentials are accepted (`BURROW_REQUIRE_AUTH`).
    pub require_auth: bool,
    /// Handshake deadline per connection (`BURROW_CONNECT_TIMEOUT`, seconds).
    pub connect_timeout: Duration,
    /// The credential oracle contents (`BURROW_CREDENTIALS`,
    /// `user:pass,user:pass`).
    pub credentials: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8888,
            max_clients: 10,
            require_auth: true,
            connect_timeout: Duration::from_secs(10),
            credentials: HashMap::from([
                ("student".into(), "secure123".into()),
                ("admin".into(), "admin123".into()),
                ("demo".into(), "demo123".into()),
            ]),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with any `BURROW_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = std::env::var("BURROW_HOST").ok().filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(port) = env_parse("BURROW_PORT") {
            config.port = port;
        }
        if let Some(max) = env_parse("BURROW_MAX_CLIENTS") {
            config.max_clients = max;
        }
        if let Some(require) = env_parse("BURROW_REQUIRE_AUTH") {
            config.require_auth = require;
        }
        if let Some(secs) = env_parse::<u64>("BURROW_CONNECT_TIMEOUT") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Ok(spec) = std::env::var("BURROW_CREDENTIALS") {
            config.credentials = parse_credentials(&spec);
        }
        config
    }

    /// The `host:port` listen address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// Parse `user:pass,user:pass`; entries without a colon are skipped.
fn parse_credentials(spec: &str) -> HashMap<String, String> {
    spec.split(',')
        .filter_map(|entry| {
            let (user, pass) = entry.split_once(':')?;
            Some((user.trim().to_string(), pass.to_string()))
        })
        .collect()
}
