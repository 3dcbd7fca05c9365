use crate::error::{DfsError, Result};
use serde::{Deserialize, Serialize};

/// Cluster-wide tuning knobs shared by all three binaries. Each binary
/// embeds these under a `settings` key in its own configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_leader_heartbeat_interval_ms")]
    pub leader_heartbeat_interval_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_replication_max_attempts")]
    pub replication_max_attempts: u32,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Whether block payload frames may be compressed on the wire.
    #[serde(default = "default_wire_compression")]
    pub wire_compression: bool,
}

fn default_block_size() -> u64 {
    4 * 1024 * 1024
}

fn default_replication_factor() -> u32 {
    2
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_heartbeat_miss_threshold() -> u32 {
    3
}

fn default_election_timeout_min_ms() -> u64 {
    3000
}

fn default_election_timeout_max_ms() -> u64 {
    6000
}

fn default_leader_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_max_frame_bytes() -> usize {
    crate::wire::DEFAULT_MAX_FRAME_BYTES
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_replication_max_attempts() -> u32 {
    5
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

fn default_wire_compression() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            replication_factor: default_replication_factor(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            leader_heartbeat_interval_ms: default_leader_heartbeat_interval_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            worker_pool_size: default_worker_pool_size(),
            replication_max_attempts: default_replication_max_attempts(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            wire_compression: default_wire_compression(),
        }
    }
}

impl Settings {
    /// Heartbeats missed for this long mark a node stale.
    pub fn staleness_cutoff_secs(&self) -> u64 {
        self.heartbeat_interval_secs * self.heartbeat_miss_threshold as u64
    }

    /// Per-block RPC deadline, scaled with the payload size.
    pub fn block_deadline(&self, block_size: u64) -> std::time::Duration {
        let per_mib = std::time::Duration::from_secs(2);
        let mib = block_size / (1024 * 1024) + 1;
        std::time::Duration::from_secs(self.rpc_timeout_secs) + per_mib * mib as u32
    }
}

/// Load a binary's configuration from an optional file plus `BASALT_`
/// environment overrides.
pub fn load_config<T: serde::de::DeserializeOwned>(path: Option<&str>) -> Result<T> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(::config::File::with_name(path));
    }
    let settings = builder
        .add_source(::config::Environment::with_prefix("BASALT").separator("__"))
        .build()
        .map_err(|e| DfsError::Config(e.to_string()))?;

    settings
        .try_deserialize()
        .map_err(|e| DfsError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.block_size, 4 * 1024 * 1024);
        assert_eq!(settings.replication_factor, 2);
        assert_eq!(settings.staleness_cutoff_secs(), 15);
    }

    #[test]
    fn test_block_deadline_scales() {
        let settings = Settings::default();
        let small = settings.block_deadline(4 * 1024);
        let large = settings.block_deadline(256 * 1024 * 1024);
        assert!(large > small);
    }
}
