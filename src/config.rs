use std::{env, path::PathBuf, time::Duration};

use crate::discovery::{RangeOrder, ScanConfig, ScanRange};
use crate::error::BridgeError;
use crate::port::{probe_end, DEFAULT_BASE_PORT, DEFAULT_PORT_SPREAD};
use crate::protocol::TransportKind;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_POLL_IDLE: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(25);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub base_port: u16,
    pub port_spread: u16,
    pub workspace_roots: Vec<PathBuf>,
    pub workspace_name: Option<String>,
    pub auth_token: Option<String>,
    pub allow_insecure_no_auth: bool,
    pub allow_query_token_auth: bool,
    pub poll_idle: Duration,
    pub poll_wait: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            base_port: DEFAULT_BASE_PORT,
            port_spread: DEFAULT_PORT_SPREAD,
            workspace_roots: Vec::new(),
            workspace_name: None,
            auth_token: None,
            allow_insecure_no_auth: false,
            allow_query_token_auth: false,
            poll_idle: DEFAULT_POLL_IDLE,
            poll_wait: DEFAULT_POLL_WAIT,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, BridgeError> {
        let host = env::var("BRIDGE_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let base_port = parse_env("BRIDGE_BASE_PORT").unwrap_or(DEFAULT_BASE_PORT);
        let port_spread = parse_env("BRIDGE_PORT_SPREAD").unwrap_or(DEFAULT_PORT_SPREAD);

        let workspace_roots = match env::var_os("BRIDGE_WORKSPACE_ROOTS") {
            Some(raw) => env::split_paths(&raw)
                .filter(|path| !path.as_os_str().is_empty())
                .collect(),
            None => env::current_dir().map(|dir| vec![dir]).unwrap_or_default(),
        };
        let workspace_name = read_trimmed("BRIDGE_WORKSPACE_NAME");

        let auth_token = read_trimmed("BRIDGE_AUTH_TOKEN");
        let allow_insecure_no_auth = parse_bool_env("BRIDGE_ALLOW_INSECURE_NO_AUTH");
        if auth_token.is_none() && !allow_insecure_no_auth {
            return Err(BridgeError::Config(
                "BRIDGE_AUTH_TOKEN is required. Set BRIDGE_ALLOW_INSECURE_NO_AUTH=true only for local development."
                    .to_string(),
            ));
        }

        let allow_query_token_auth = parse_bool_env("BRIDGE_ALLOW_QUERY_TOKEN_AUTH");
        let poll_idle = parse_env::<u64>("BRIDGE_POLL_IDLE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_IDLE);

        Ok(Self {
            host,
            base_port,
            port_spread,
            workspace_roots,
            workspace_name,
            auth_token,
            allow_insecure_no_auth,
            allow_query_token_auth,
            poll_idle,
            poll_wait: DEFAULT_POLL_WAIT,
        })
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_token.is_some()
    }
}

/// Client-side settings: where to look and how hard to try.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub scan_host: String,
    pub scan: ScanConfig,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub auth_token: Option<String>,
    pub auto_reconnect: bool,
    /// Transports the session may use. Order does not matter; WebSocket is
    /// preferred and polling is the fallback.
    pub transports: Vec<TransportKind>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scan_host: DEFAULT_HOST.to_string(),
            scan: ScanConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            auth_token: None,
            auto_reconnect: false,
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(host) = read_trimmed("BRIDGE_SCAN_HOST") {
            config.scan_host = host;
        }
        if let Some(concurrency) = parse_env::<usize>("BRIDGE_SCAN_CONCURRENCY") {
            config.scan.concurrency = concurrency;
        }
        if let Some(ms) = parse_env::<u64>("BRIDGE_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_env::<u32>("BRIDGE_MAX_RETRIES") {
            config.max_retries = retries;
        }
        if parse_bool_env("BRIDGE_SCAN_INTERLEAVED") {
            config.scan.order = RangeOrder::Interleaved;
        }

        let base_port = parse_env("BRIDGE_BASE_PORT").unwrap_or(DEFAULT_BASE_PORT);
        let spread = parse_env("BRIDGE_PORT_SPREAD").unwrap_or(DEFAULT_PORT_SPREAD);
        if let Some(workspace) = config.scan.ranges.first_mut() {
            *workspace = ScanRange::new("workspace", base_port, probe_end(base_port, spread));
        }

        config.auth_token = read_trimmed("BRIDGE_AUTH_TOKEN");
        config.auto_reconnect = parse_bool_env("BRIDGE_AUTO_RECONNECT");
        if let Some(raw) = read_trimmed("BRIDGE_TRANSPORTS") {
            let transports = parse_transports(&raw);
            if !transports.is_empty() {
                config.transports = transports;
            }
        }
        config
    }
}

/// Comma-separated `websocket` / `polling`; unknown names are skipped.
fn parse_transports(raw: &str) -> Vec<TransportKind> {
    let mut transports = Vec::new();
    for name in raw.split(',').map(str::trim) {
        let kind = match name.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => TransportKind::WebSocket,
            "polling" | "poll" => TransportKind::Polling,
            _ => continue,
        };
        if !transports.contains(&kind) {
            transports.push(kind);
        }
    }
    transports
}

fn read_trimmed(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
