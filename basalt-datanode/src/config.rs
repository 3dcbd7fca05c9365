use basalt_core::settings::Settings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Namenode endpoints in preference order; the first reachable leader
    /// wins.
    #[serde(default = "default_namenode_endpoints")]
    pub namenode_endpoints: Vec<String>,
    /// Free space kept back from the reported capacity.
    #[serde(default = "default_reserved_bytes")]
    pub reserved_bytes: u64,
    #[serde(default)]
    pub settings: Settings,
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9300
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/datanode")
}

fn default_namenode_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:9000".to_string()]
}

fn default_reserved_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for DataNodeConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            storage_root: default_storage_root(),
            namenode_endpoints: default_namenode_endpoints(),
            reserved_bytes: default_reserved_bytes(),
            settings: Settings::default(),
        }
    }
}
