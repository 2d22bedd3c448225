//! Client configuration.

use std::str::FromStr;
use std::time::Duration;

/// Tunable client settings; `Default` targets a local server.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server host (`BURROW_SERVER_HOST`).
    pub server_host: String,
    /// Server port (`BURROW_SERVER_PORT`).
    pub server_port: u16,
    /// Handshake deadline (`BURROW_CONNECT_TIMEOUT`, seconds).
    pub connect_timeout: Duration,
    /// Background keepalive cadence (`BURROW_KEEPALIVE_INTERVAL`, seconds).
    pub keepalive_interval: Duration,
    /// Local HTTP proxy port (`BURROW_PROXY_PORT`).
    pub proxy_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".into(),
            server_port: 8888,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            proxy_port: 8080,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with any `BURROW_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = std::env::var("BURROW_SERVER_HOST").ok().filter(|h| !h.is_empty()) {
            config.server_host = host;
        }
        if let Some(port) = env_parse("BURROW_SERVER_PORT") {
            config.server_port = port;
        }
        if let Some(secs) = env_parse::<f64>("BURROW_CONNECT_TIMEOUT") {
            config.connect_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = env_parse::<f64>("BURROW_KEEPALIVE_INTERVAL") {
            config.keepalive_interval = Duration::from_secs_f64(secs);
        }
        if let Some(port) = env_parse("BURROW_PROXY_PORT") {
            config.proxy_port = port;
        }
        config
    }

    /// The `host:port` server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
