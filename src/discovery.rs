//! Client-side discovery of a running bridge server by probing local ports.
//!
//! A probe is a single `GET /health` with a hard timeout. Misses are never
//! errors: an unreachable port is a `ScanResult` with `reachable == false`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use crate::port::{probe_end, DEFAULT_BASE_PORT, DEFAULT_PORT_SPREAD};
use crate::protocol::{WorkspaceHint, SERVICE_NAME};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(400);
pub const DEFAULT_SCAN_CONCURRENCY: usize = 16;
/// Ports earlier bridge releases listened on by default.
pub const COMMON_PORTS: &[u16] = &[37100, 8787, 3000, 3001];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub host: String,
    pub port: u16,
    pub reachable: bool,
    pub is_target_service: bool,
    pub service_version: Option<String>,
    pub workspace_hint: Option<WorkspaceHint>,
}

impl ScanResult {
    pub fn unreachable(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            reachable: false,
            is_target_service: false,
            service_version: None,
            workspace_hint: None,
        }
    }

    pub fn foreign(host: &str, port: u16) -> Self {
        Self {
            reachable: true,
            ..Self::unreachable(host, port)
        }
    }

    /// Classifies a successful `/health` body.
    pub fn from_health_body(host: &str, port: u16, body: &Value) -> Self {
        let is_target = body.get("service").and_then(Value::as_str) == Some(SERVICE_NAME);
        if !is_target {
            return Self::foreign(host, port);
        }

        Self {
            host: host.to_string(),
            port,
            reachable: true,
            is_target_service: true,
            service_version: body
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string),
            workspace_hint: body
                .get("workspace")
                .cloned()
                .and_then(|value| serde_json::from_value(value).ok()),
        }
    }
}

/// A named inclusive port range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    pub name: String,
    pub start: u16,
    pub end: u16,
}

impl ScanRange {
    pub fn new(name: impl Into<String>, start: u16, end: u16) -> Self {
        Self {
            name: name.into(),
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// How `find_server` walks the configured ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeOrder {
    /// Exhaust each range in list order; the first range with a hit wins.
    #[default]
    Priority,
    /// Merge all ranges into one ascending sweep; the lowest port wins.
    Interleaved,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub probe_timeout: Duration,
    pub concurrency: usize,
    pub common_ports: Vec<u16>,
    pub ranges: Vec<ScanRange>,
    pub order: RangeOrder,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            concurrency: DEFAULT_SCAN_CONCURRENCY,
            common_ports: COMMON_PORTS.to_vec(),
            ranges: vec![
                ScanRange::new(
                    "workspace",
                    DEFAULT_BASE_PORT,
                    probe_end(DEFAULT_BASE_PORT, DEFAULT_PORT_SPREAD),
                ),
                ScanRange::new("well-known", 8787, 8797),
            ],
            order: RangeOrder::Priority,
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> ScanResult;
}

/// Probes `http://host:port/health` with reqwest.
#[derive(Clone, Default)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> ScanResult {
        let url = format!("http://{host}:{port}/health");
        let response = match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(error) => {
                if error.is_connect() || error.is_timeout() {
                    return ScanResult::unreachable(host, port);
                }
                // Something answered but not with HTTP we understand.
                debug!(port, error = %error, "probe failed after connect");
                return ScanResult::foreign(host, port);
            }
        };

        if !response.status().is_success() {
            return ScanResult::foreign(host, port);
        }

        match tokio::time::timeout(timeout, response.json::<Value>()).await {
            Ok(Ok(body)) => ScanResult::from_health_body(host, port, &body),
            _ => ScanResult::foreign(host, port),
        }
    }
}

#[derive(Clone)]
pub struct Scanner {
    probe: Arc<dyn Probe>,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self::with_probe(config, Arc::new(HttpProbe::new()))
    }

    pub fn with_probe(config: ScanConfig, probe: Arc<dyn Probe>) -> Self {
        Self { probe, config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub async fn scan_one(&self, host: &str, port: u16) -> ScanResult {
        self.probe
            .probe(host, port, self.config.probe_timeout)
            .await
    }

    /// Probes every port in `start..=end`, `concurrency` at a time.
    ///
    /// Batches run strictly one after another and each batch waits for all of
    /// its probes, so at most `concurrency` sockets are open at once.
    pub async fn scan_range(
        &self,
        host: &str,
        start: u16,
        end: u16,
        concurrency: usize,
    ) -> Vec<ScanResult> {
        let ports = (start.min(end)..=start.max(end)).collect::<Vec<_>>();
        self.scan_ports(host, &ports, concurrency).await
    }

    async fn scan_ports(&self, host: &str, ports: &[u16], concurrency: usize) -> Vec<ScanResult> {
        let mut results = Vec::with_capacity(ports.len());
        for batch in ports.chunks(concurrency.max(1)) {
            let probes = batch.iter().map(|&port| self.scan_one(host, port));
            results.extend(join_all(probes).await);
        }
        results
    }

    /// Scans ports batch by batch and stops after the first batch with a hit.
    async fn first_hit(&self, host: &str, ports: &[u16]) -> Option<ScanResult> {
        for batch in ports.chunks(self.config.concurrency.max(1)) {
            let probes = batch.iter().map(|&port| self.scan_one(host, port));
            let hit = join_all(probes)
                .await
                .into_iter()
                .find(|result| result.is_target_service);
            if hit.is_some() {
                return hit;
            }
        }
        None
    }

    /// Tries the common ports first, then falls back to `find_server`.
    pub async fn quick_scan(&self, host: &str) -> Option<ScanResult> {
        let common = self.config.common_ports.clone();
        if let Some(hit) = self.first_hit(host, &common).await {
            info!(port = hit.port, "bridge found on common port");
            return Some(hit);
        }
        self.find_server(host).await
    }

    /// First bridge found in the configured ranges, honoring `RangeOrder`.
    pub async fn find_server(&self, host: &str) -> Option<ScanResult> {
        match self.config.order {
            RangeOrder::Priority => {
                for range in &self.config.ranges {
                    let ports = range.ports().collect::<Vec<_>>();
                    if let Some(hit) = self.first_hit(host, &ports).await {
                        info!(port = hit.port, range = %range.name, "bridge found");
                        return Some(hit);
                    }
                    debug!(range = %range.name, "no bridge in range");
                }
                None
            }
            RangeOrder::Interleaved => {
                let ports = self.merged_ports();
                let hit = self.first_hit(host, &ports).await;
                if let Some(hit) = &hit {
                    info!(port = hit.port, "bridge found");
                }
                hit
            }
        }
    }

    /// Every bridge in every configured range, ascending by port.
    pub async fn find_all_servers(&self, host: &str) -> Vec<ScanResult> {
        let ports = self.merged_ports();
        self.scan_ports(host, &ports, self.config.concurrency)
            .await
            .into_iter()
            .filter(|result| result.is_target_service)
            .collect()
    }

    fn merged_ports(&self) -> Vec<u16> {
        self.config
            .ranges
            .iter()
            .flat_map(ScanRange::ports)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
