//! Configuration schema and loader for shardkv nodes.

use serde::{Deserialize, Serialize};
use shardkv_ring::PositionHasher;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Socket address the node binds.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// This node's `ip:port` as the rest of the cluster knows it. Defaults to
    /// `listen`.
    #[serde(default)]
    pub advertise: Option<String>,

    /// Initial membership view.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Initial shard count.
    #[serde(default = "default_shards")]
    pub shards: usize,

    #[serde(default)]
    pub ring: RingConfig,

    #[serde(default)]
    pub gossip: GossipSettings,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            advertise: None,
            peers: Vec::new(),
            shards: default_shards(),
            ring: RingConfig::default(),
            gossip: GossipSettings::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Number of positions on the hash ring.
    #[serde(default = "default_ring_size")]
    pub size: u64,

    /// Virtual nodes per shard.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            size: default_ring_size(),
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipSettings {
    /// Time between anti-entropy rounds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Polling granularity of the background loop.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Partners contacted per round.
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    /// Bound on every outbound peer request, connect included.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            tick_ms: default_tick_ms(),
            fanout: default_fanout(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl GossipSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the WAL.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

// --- Defaults ---

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8090))
}
fn default_shards() -> usize {
    1
}
fn default_ring_size() -> u64 {
    shardkv_ring::hasher::DEFAULT_RING_SIZE
}
fn default_virtual_nodes() -> usize {
    shardkv_ring::hasher::DEFAULT_VIRTUAL_NODES
}
fn default_interval_ms() -> u64 {
    5000
}
fn default_tick_ms() -> u64 {
    50
}
fn default_fanout() -> usize {
    2
}
fn default_rpc_timeout_ms() -> u64 {
    2000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// The address this node goes by in views, snapshots and clocks.
    pub fn identity(&self) -> String {
        self.advertise
            .clone()
            .unwrap_or_else(|| self.listen.to_string())
    }

    pub fn hasher(&self) -> Result<PositionHasher, ConfigError> {
        PositionHasher::new(self.ring.size, self.ring.virtual_nodes)
            .map_err(|e| ConfigError::Invalid(format!("ring: {e}")))
    }

    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::Invalid("shards must be > 0".into()));
        }
        self.hasher()?;
        if self.gossip.fanout == 0 {
            return Err(ConfigError::Invalid("gossip.fanout must be > 0".into()));
        }
        if self.gossip.tick_ms >= self.gossip.interval_ms {
            return Err(ConfigError::Invalid(format!(
                "gossip.tick_ms ({}) must be < gossip.interval_ms ({})",
                self.gossip.tick_ms, self.gossip.interval_ms
            )));
        }
        let me = self.identity();
        if !self.peers.is_empty() && !self.peers.contains(&me) {
            return Err(ConfigError::Invalid(format!(
                "advertised address {me} is not in peers"
            )));
        }
        Ok(())
    }

    /// Apply `VIEW`, `S` and `IP_PORT` overrides from `lookup`, then
    /// re-validate.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(view) = lookup("VIEW") {
            self.peers = view
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(s) = lookup("S") {
            self.shards = s
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("S must be a number, got {s:?}")))?;
        }
        if let Some(addr) = lookup("IP_PORT") {
            let addr = addr.trim();
            if !addr.is_empty() {
                // An untouched listen address follows the advertised port on
                // every interface.
                if self.listen == default_listen() {
                    self.listen = SocketAddr::from(([0, 0, 0, 0], advertised_port(addr)?));
                }
                self.advertise = Some(addr.to_string());
            }
        }
        self.validate()
    }

    /// [`apply_overrides`](Self::apply_overrides) from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|k| std::env::var(k).ok())
    }
}

fn advertised_port(addr: &str) -> Result<u16, ConfigError> {
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| ConfigError::Invalid(format!("IP_PORT must be ip:port, got {addr:?}")))
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
