//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration. Every field has a workable default, so an empty
/// file (or none at all) yields a plain direct-capable proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen addresses, `[host]:port` each.
    pub listens: Vec<String>,
    /// Upstream lookup/dial/handshake timeout in seconds; data transfer
    /// budgets scale up from this.
    pub upstream_timeout: u64,
    /// Probed to tell "we are offline" apart from per-host failures.
    pub net_probe_url: String,
    /// Race all resolved IPs of a destination.
    pub parallel_dial: bool,
    /// Upstream proxy URLs, comma-separated; entries without a scheme
    /// adopt all supported schemes (http, socks5, socks4a).
    pub proxies: String,
    /// Probed through each proxy to rank the pools.
    pub proxy_probe_url: String,
    /// PAC file served by the HTTP front-end, if any.
    pub pac_file: Option<String>,
    /// Where direct-connection quality is persisted.
    pub stat_file: String,
    /// Validity of a stat, in hours.
    pub stat_validity: u64,
    /// File of blocked domains (suffix) or IPs (prefix): go proxied
    /// directly, with one direct try if no proxy works.
    pub blocked_rules: String,
    /// File of direct domains (suffix) or IPs (prefix): never proxied.
    /// Direct wins over blocked.
    pub direct_rules: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listens: vec![crate::DEFAULT_LISTEN.to_string()],
            upstream_timeout: crate::DEFAULT_TIMEOUT_SECS,
            net_probe_url: "https://example.com".to_string(),
            parallel_dial: true,
            proxies: String::new(),
            proxy_probe_url: "https://www.google.com".to_string(),
            pac_file: None,
            stat_file: "stat.json".to_string(),
            stat_validity: 168,
            blocked_rules: "blocked".to_string(),
            direct_rules: "direct".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("failed to write config: {}", e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout.max(1))
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.stat_validity.max(1) * 3600)
    }
}
