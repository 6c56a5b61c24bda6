use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use blogmesh_sync::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

pub const DEFAULT_ANNOUNCE_TOPIC: &str = "blogmesh/announce/v1";

/// Relay configuration, loadable from TOML. Durations are in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Holds the datastore and blockstore.
    pub data_dir: PathBuf,
    pub listen_host: IpAddr,
    /// Peer transport port. 0 picks an ephemeral port.
    pub tcp_port: u16,
    /// Metrics HTTP port. 0 disables the endpoint.
    pub metrics_port: u16,
    /// Peers dialed at startup.
    pub bootstrap: Vec<SocketAddr>,
    pub identify_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub pin: PinConfig,
    /// File the final metrics exposition is written to on shutdown.
    pub metrics_dump_path: Option<PathBuf>,
    pub announce_topic: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("blogmesh-data"),
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 4001,
            metrics_port: 9090,
            bootstrap: Vec::new(),
            identify_timeout_ms: 5_000,
            dial_timeout_ms: 10_000,
            pin: PinConfig::default(),
            metrics_dump_path: None,
            announce_topic: DEFAULT_ANNOUNCE_TOPIC.to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PinConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    /// Upper bound on one fetch attempt; absent means unbounded.
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for PinConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            base_delay_ms: millis(policy.base_delay),
            fetch_timeout_ms: policy.fetch_timeout.map(millis),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RelayConfig {
    /// Read a TOML file. Keys missing from the file keep their defaults.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.pin.attempts == 0 {
            return Err(ServerError::Config("pin.attempts must be at least 1".into()));
        }
        if self.announce_topic.trim().is_empty() {
            return Err(ServerError::Config("announce_topic must not be empty".into()));
        }
        if self.identify_timeout_ms == 0 || self.dial_timeout_ms == 0 {
            return Err(ServerError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.tcp_port)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        (self.metrics_port != 0).then(|| SocketAddr::new(self.listen_host, self.metrics_port))
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.pin.attempts,
            base_delay: Duration::from_millis(self.pin.base_delay_ms),
            fetch_timeout: self.pin.fetch_timeout_ms.map(Duration::from_millis),
        }
    }
}
