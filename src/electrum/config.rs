//! Electrum client configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// One server, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self { Self { host: host.into(), port } }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.host, self.port) }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches("tcp://");
        let (host, port) = trimmed.rsplit_once(':').ok_or_else(|| format!("expected host:port, got {}", s))?;
        if host.is_empty() {
            return Err(format!("missing host in {}", s));
        }
        let port = port.parse().map_err(|_| format!("invalid port in {}", s))?;
        Ok(Self { host: host.trim_start_matches('[').trim_end_matches(']').to_string(), port })
    }
}

/// Longest line accepted from a server before the connection is dropped.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ElectrumConfig {
    pub endpoints: Vec<Endpoint>,
    pub client_name: String,
    pub protocol_version: String,
    /// Zero disables keep-alive pings
    pub keep_alive_interval: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Zero disables the sweep (handshake timeouts, lag checks, redials)
    pub sweep_interval: Duration,
    pub max_line_length: usize,
    /// Servers this many blocks behind the best known height are dropped
    pub max_height_lag: u64,
    /// Share of the other verified connections a subscription is copied to
    pub redundancy: f64,
    /// Servers reporting a lower tip than this are dropped
    pub last_known_height: Option<u64>,
}

impl Default for ElectrumConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            client_name: concat!("beesync/", env!("CARGO_PKG_VERSION")).into(),
            protocol_version: "1.4".into(),
            keep_alive_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_height_lag: 50,
            redundancy: 0.8,
            last_known_height: None,
        }
    }
}

impl ElectrumConfig {
    pub fn new(endpoints: Vec<Endpoint>) -> Self { Self { endpoints, ..Default::default() } }
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self { self.endpoints.push(endpoint); self }
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self { self.client_name = name.into(); self }
    pub fn with_protocol_version(mut self, v: impl Into<String>) -> Self { self.protocol_version = v.into(); self }
    pub fn with_keep_alive(mut self, interval: Duration) -> Self { self.keep_alive_interval = interval; self }
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self { self.handshake_timeout = timeout; self }
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self { self.connect_timeout = timeout; self }
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self { self.sweep_interval = interval; self }
    pub fn with_max_line_length(mut self, max: usize) -> Self { self.max_line_length = max.max(1); self }
    pub fn with_max_height_lag(mut self, lag: u64) -> Self { self.max_height_lag = lag; self }
    pub fn with_redundancy(mut self, redundancy: f64) -> Self { self.redundancy = redundancy.clamp(0.0, 1.0); self }
    pub fn with_last_known_height(mut self, height: u64) -> Self { self.last_known_height = Some(height); self }

    /// Extra connections a subscription reaches beyond its primary.
    pub fn fan_out(&self, other_verified: usize) -> usize {
        (self.redundancy * other_verified as f64).floor() as usize
    }
}
