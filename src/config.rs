//! Command-line and environment configuration

use clap::Parser;
use std::net::{AddrParseError, SocketAddr};

use crate::filter::DEFAULT_LOGO_BASE;
use crate::inspector::InspectorConfig;
use crate::provider::{HttpSourceConfig, DEFAULT_API_BASE, DEFAULT_HTTP_TIMEOUT_MS};
use crate::upstream::{UpstreamConfig, DEFAULT_WS_URL};

/// Blocks scanned once at startup
pub const DEFAULT_INITIAL_SCAN_LIMIT: usize = 20;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Relay of blocks carrying the SYS marker")]
pub struct Settings {
    /// Interface the HTTP and WebSocket server binds to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
    /// Esplora-compatible REST base
    #[arg(long, env = "MEMPOOL_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,
    /// Push feed announcing new blocks
    #[arg(long, env = "MEMPOOL_WS_URL", default_value = DEFAULT_WS_URL)]
    pub ws_url: String,
    #[arg(long, env = "POOL_LOGO_BASE", default_value = DEFAULT_LOGO_BASE)]
    pub logo_base: String,
    /// Recent blocks inspected at startup; 0 disables the scan
    #[arg(long, env = "INITIAL_SCAN_LIMIT", default_value_t = DEFAULT_INITIAL_SCAN_LIMIT)]
    pub initial_scan_limit: usize,
    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = DEFAULT_HTTP_TIMEOUT_MS)]
    pub http_timeout_ms: u64,
}

impl Settings {
    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.bind_addr, self.port).parse()
    }

    pub fn source_config(&self) -> HttpSourceConfig {
        HttpSourceConfig {
            base_url: self.api_base.clone(),
            timeout_ms: self.http_timeout_ms,
        }
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig::with_url(self.ws_url.clone())
    }

    pub fn inspector_config(&self) -> InspectorConfig {
        InspectorConfig {
            logo_base: self.logo_base.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::{MAX_EXTRA_PAGES, PAGE_SIZE};
    use crate::upstream::PING_INTERVAL_MS;
    use std::time::Duration;

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["sysblock-relay"];
        argv.extend_from_slice(args);
        Settings::try_parse_from(argv).unwrap()
    }

    // ==================== parsing tests ====================

    #[test]
    fn test_explicit_arguments() {
        let settings = parse(&[
            "--bind-addr",
            "127.0.0.1",
            "--port",
            "8080",
            "--api-base",
            "http://localhost:3002/api",
            "--ws-url",
            "ws://localhost:8999/api/v1/ws",
            "--logo-base",
            "http://logos.local/",
            "--initial-scan-limit",
            "0",
            "--http-timeout-ms",
            "2500",
        ]);

        assert_eq!(settings.listen_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(settings.api_base, "http://localhost:3002/api");
        assert_eq!(settings.ws_url, "ws://localhost:8999/api/v1/ws");
        assert_eq!(settings.initial_scan_limit, 0);
        assert_eq!(settings.http_timeout_ms, 2500);
    }

    #[test]
    fn test_rejects_invalid_port() {
        let result = Settings::try_parse_from(["sysblock-relay", "--port", "not-a-port"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_bind_addr() {
        let settings = parse(&["--bind-addr", "not an ip"]);
        assert!(settings.listen_addr().is_err());
    }

    // ==================== conversion tests ====================

    #[test]
    fn test_source_config() {
        let settings = parse(&["--api-base", "http://x/api", "--http-timeout-ms", "1234"]);
        let cfg = settings.source_config();
        assert_eq!(cfg.base_url, "http://x/api");
        assert_eq!(cfg.timeout_ms, 1234);
    }

    #[test]
    fn test_upstream_config_keeps_default_timers() {
        let settings = parse(&["--ws-url", "ws://feed.local/ws"]);
        let cfg = settings.upstream_config();
        assert_eq!(cfg.url, "ws://feed.local/ws");
        assert_eq!(cfg.ping_interval, Duration::from_millis(PING_INTERVAL_MS));
    }

    #[test]
    fn test_inspector_config_trims_logo_base() {
        let settings = parse(&["--logo-base", "http://logos.local/"]);
        let cfg = settings.inspector_config();
        assert_eq!(cfg.logo_base, "http://logos.local");
        assert_eq!(cfg.page_size, PAGE_SIZE);
        assert_eq!(cfg.max_extra_pages, MAX_EXTRA_PAGES);
    }
}
