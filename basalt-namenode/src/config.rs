use basalt_core::settings::Settings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameNodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Endpoint other nodes use to reach this one; defaults to host:port.
    #[serde(default)]
    pub advertise_endpoint: Option<String>,
    /// Control endpoint of the metadata peer, when running as an HA pair.
    #[serde(default)]
    pub peer_endpoint: Option<String>,
    #[serde(default = "default_db_path")]
    pub metadata_db_path: PathBuf,
    #[serde(default = "default_oplog_path")]
    pub oplog_path: PathBuf,
    /// How long a node may stay INACTIVE before it is dropped from the
    /// registry.
    #[serde(default = "default_retire_after_secs")]
    pub retire_after_secs: u64,
    /// Usage spread (fraction of capacity) that triggers a rebalance.
    #[serde(default = "default_balance_threshold")]
    pub balance_threshold: f64,
    #[serde(default = "default_balance_interval_secs")]
    pub balance_interval_secs: u64,
    #[serde(default)]
    pub settings: Settings,
}

fn default_node_id() -> String {
    "namenode-1".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/namenode/metadata.db")
}

fn default_oplog_path() -> PathBuf {
    PathBuf::from("./data/namenode/metadata.oplog")
}

fn default_retire_after_secs() -> u64 {
    7200
}

fn default_balance_threshold() -> f64 {
    0.2
}

fn default_balance_interval_secs() -> u64 {
    300
}

impl NameNodeConfig {
    pub fn effective_endpoint(&self) -> String {
        self.advertise_endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

impl Default for NameNodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            host: default_host(),
            port: default_port(),
            advertise_endpoint: None,
            peer_endpoint: None,
            metadata_db_path: default_db_path(),
            oplog_path: default_oplog_path(),
            retire_after_secs: default_retire_after_secs(),
            balance_threshold: default_balance_threshold(),
            balance_interval_secs: default_balance_interval_secs(),
            settings: Settings::default(),
        }
    }
}
