//! Environment-driven configuration.
//!
//! Everything the process needs at startup comes from the environment
//! (optionally via a `.env` file loaded by the binary). Per-session
//! settings such as proxies are persisted on the session record instead.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Gateway process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bind address for the HTTP listener.
    pub bind: SocketAddr,
    /// `RUST_LOG`-style filter directive, e.g. `info` or `whatsapp_gateway=debug`.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Shared API key for the authenticated endpoints. `None` disables auth
    /// (development only).
    pub api_key: Option<String>,
    /// SQLite database URL, e.g. `sqlite://gateway.db`.
    pub database_url: String,
    /// Global webhook endpoint, attached to every session when set.
    pub webhook_url: Option<String>,
    /// Secret for signing webhook bodies.
    pub webhook_secret: Option<String>,
    /// Chatwoot base URL for the helpdesk bridge, attached when set.
    pub chatwoot_url: Option<String>,
    pub chatwoot_token: Option<String>,
}

impl Config {
    /// Read configuration from the environment, applying defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let host: IpAddr = match env::var("GATEWAY_HOST") {
            Ok(v) => v
                .parse()
                .map_err(|_| anyhow::anyhow!("GATEWAY_HOST is not a valid IP address: {v}"))?,
            Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let port: u16 = match env::var("GATEWAY_PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| anyhow::anyhow!("GATEWAY_PORT is not a valid port: {v}"))?,
            Err(_) => 8080,
        };

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            bind: SocketAddr::new(host, port),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            api_key: non_empty(env::var("API_KEY").ok()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://gateway.db".to_string()),
            webhook_url: non_empty(env::var("WEBHOOK_URL").ok()),
            webhook_secret: non_empty(env::var("WEBHOOK_SECRET").ok()),
            chatwoot_url: non_empty(env::var("CHATWOOT_URL").ok()),
            chatwoot_token: non_empty(env::var("CHATWOOT_TOKEN").ok()),
        })
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}
