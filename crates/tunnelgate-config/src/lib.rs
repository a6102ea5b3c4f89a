//! Process configuration and logging setup for the tunnel server.
//!
//! Mirrors the corpus convention of a single `clap::Parser` struct with
//! `#[arg(long, env = "...")]` fields and a one-shot `tracing-subscriber`
//! `EnvFilter` initializer.

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default cap on simultaneously connected reverse tunnel sockets per client.
pub const DEFAULT_MAX_TCP_SOCKETS: u32 = 10;

/// Tunnel server configuration, loaded from CLI flags with environment
/// variable fallbacks.
#[derive(Parser, Debug, Clone)]
#[command(name = "tunnelgate")]
#[command(about = "Public-facing tunnel server")]
#[command(version)]
pub struct Config {
    /// Base domain that subdomain tunnels are served under (e.g. `tunnel.dev`).
    #[arg(long, env = "TUNNELGATE_DOMAIN")]
    pub domain: String,

    /// URL the landing page redirects bare, non-tunnel requests to.
    #[arg(long, env = "TUNNELGATE_LANDING")]
    pub landing: String,

    /// Whether the public endpoint is served over HTTPS (affects synthesized
    /// tunnel URLs only; this crate does not terminate TLS itself).
    #[arg(long, env = "TUNNELGATE_SECURE")]
    pub secure: bool,

    /// Cap on simultaneously connected reverse tunnel sockets per client.
    #[arg(long, env = "TUNNELGATE_MAX_TCP_SOCKETS", default_value_t = DEFAULT_MAX_TCP_SOCKETS)]
    pub max_tcp_sockets: u32,

    /// Port range `first:last` that tunnel-socket acceptors bind from. When
    /// absent, the OS assigns an ephemeral port per client.
    #[arg(long, env = "TUNNELGATE_RANGE")]
    pub range: Option<String>,

    /// Fallback kill-auth secret for sessions created without their own
    /// bearer token. Absent disables kill-auth for those sessions.
    #[arg(long, env = "TUNNELGATE_SECRET")]
    pub secret: Option<String>,

    /// Public HTTP listener port.
    #[arg(long, env = "TUNNELGATE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Public HTTP listener bind address.
    #[arg(long, env = "TUNNELGATE_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// `tracing-subscriber` `EnvFilter` directive, e.g. `info` or `debug`.
    #[arg(long, env = "TUNNELGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Synthesize the public URL for a tunnel subdomain, given this
    /// configuration's `domain`/`secure` settings.
    pub fn tunnel_url(&self, id: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{id}.{domain}", domain = self.domain)
    }
}

/// Initialize process-wide structured logging from `log_level`.
pub fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_url_reflects_the_secure_flag() {
        let mut config = Config::try_parse_from([
            "tunnelgate",
            "--domain",
            "tunnel.dev",
            "--landing",
            "https://tunnel.dev",
        ])
        .unwrap();

        assert_eq!(config.tunnel_url("foo"), "http://foo.tunnel.dev");
        config.secure = true;
        assert_eq!(config.tunnel_url("foo"), "https://foo.tunnel.dev");
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::try_parse_from([
            "tunnelgate",
            "--domain",
            "tunnel.dev",
            "--landing",
            "https://tunnel.dev",
        ])
        .unwrap();

        assert_eq!(config.max_tcp_sockets, DEFAULT_MAX_TCP_SOCKETS);
        assert_eq!(config.port, 8080);
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.log_level, "info");
        assert!(config.range.is_none());
        assert!(config.secret.is_none());
        assert!(!config.secure);
    }
}
