//! Registration and heartbeat agent.
//!
//! On start-up the node registers with the namenode (re-using a persisted
//! identity if one exists), sends a full block report, then heartbeats
//! every `heartbeat_interval_secs`. A heartbeat rejected with `NotFound`
//! means the namenode no longer knows this node; the agent re-registers
//! and re-reports on the next tick.

use crate::config::DataNodeConfig;
use crate::service::DataNodeState;
use basalt_core::error::{DfsError, Result};
use basalt_core::types::{
    BlockReport, DataNodeInfo, ErrorBody, HeartbeatRequest, RegisterDataNodeRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Thin control-plane client shared by the agent and the data-plane
/// service. Rotates across the configured namenode endpoints and follows
/// leader redirects.
pub struct NameNodeHandle {
    endpoints: Vec<String>,
    current: AtomicUsize,
    client: reqwest::Client,
    timeout: Duration,
}

impl NameNodeHandle {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Self {
        Self {
            endpoints,
            current: AtomicUsize::new(0),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoints[self.current.load(Ordering::Relaxed) % self.endpoints.len()]
    }

    fn rotate(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.send_post(path, body).await?;
        response.json().await.map_err(DfsError::http)
    }

    /// POST where the caller only cares about success.
    pub async fn post_ack<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        self.send_post(path, body).await.map(|_| ())
    }

    /// DELETE where the caller only cares about success.
    pub async fn delete_ack(&self, path: &str) -> Result<()> {
        let mut last_err = DfsError::Transient("no namenode endpoints configured".to_string());
        for _ in 0..self.endpoints.len().max(1) * 2 {
            let url = format!("{}{}", self.endpoint(), path);
            match self.client.delete(&url).timeout(self.timeout).send().await {
                Ok(response) => match check_response(response).await {
                    Ok(_) => return Ok(()),
                    Err(DfsError::NotLeader { leader }) => {
                        last_err = DfsError::NotLeader { leader };
                        self.rotate();
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    last_err = DfsError::Transient(err.to_string());
                    self.rotate();
                }
            }
        }
        Err(last_err)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut last_err = DfsError::Transient("no namenode endpoints configured".to_string());
        for _ in 0..self.endpoints.len().max(1) * 2 {
            let url = format!("{}{}", self.endpoint(), path);
            match self.client.get(&url).timeout(self.timeout).send().await {
                Ok(response) => match check_response(response).await {
                    Ok(response) => return response.json().await.map_err(DfsError::http),
                    Err(DfsError::NotLeader { leader }) => {
                        last_err = DfsError::NotLeader { leader };
                        self.rotate();
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    last_err = DfsError::Transient(err.to_string());
                    self.rotate();
                }
            }
        }
        Err(last_err)
    }

    async fn send_post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let mut last_err = DfsError::Transient("no namenode endpoints configured".to_string());
        for _ in 0..self.endpoints.len().max(1) * 2 {
            let url = format!("{}{}", self.endpoint(), path);
            match self
                .client
                .post(&url)
                .timeout(self.timeout)
                .json(body)
                .send()
                .await
            {
                Ok(response) => match check_response(response).await {
                    Ok(response) => return Ok(response),
                    Err(DfsError::NotLeader { leader }) => {
                        last_err = DfsError::NotLeader { leader };
                        self.rotate();
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    last_err = DfsError::Transient(err.to_string());
                    self.rotate();
                }
            }
        }
        Err(last_err)
    }
}

/// Map non-success responses onto the shared error taxonomy.
pub async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
        code: "HTTP".to_string(),
        message: status.to_string(),
        details: None,
    });
    Err(DfsError::from_code(
        &body.code,
        body.message,
        body.details.as_deref(),
    ))
}

/// Register with the namenode, keeping the assigned node id across
/// restarts in `<root>/node_id`.
pub async fn register(config: &DataNodeConfig, handle: &NameNodeHandle) -> Result<Uuid> {
    let id_path = config.storage_root.join("node_id");
    let persisted = match std::fs::read_to_string(&id_path) {
        Ok(raw) => Uuid::parse_str(raw.trim()).ok(),
        Err(_) => None,
    };

    let request = RegisterDataNodeRequest {
        node_id: persisted,
        hostname: config.hostname.clone(),
        port: config.port,
        storage_capacity: fs2::total_space(&config.storage_root)?,
        available_space: fs2::available_space(&config.storage_root)?
            .saturating_sub(config.reserved_bytes),
    };

    let info: DataNodeInfo = handle.post_json("/datanodes/register", &request).await?;
    std::fs::write(&id_path, info.node_id.to_string())?;
    tracing::info!("registered as datanode {}", info.node_id);
    Ok(info.node_id)
}

pub async fn send_block_report(state: &DataNodeState) -> Result<()> {
    let blocks = state.store.report_blocks().await?;
    let report = BlockReport {
        node_id: state.node_id,
        blocks,
    };
    state.namenode.post_ack("/blocks/report", &report).await
}

/// Long-running heartbeat loop. Re-registers when the namenode has
/// forgotten this node (registry retirement or a wiped metadata store).
pub async fn heartbeat_loop(state: Arc<DataNodeState>, config: DataNodeConfig) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.settings.heartbeat_interval_secs,
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let available_space = match state.store.available_space() {
            Ok(space) => space,
            Err(err) => {
                tracing::warn!("failed to read available space: {err}");
                continue;
            }
        };

        let request = HeartbeatRequest {
            available_space,
            blocks_stored: state.store.blocks_stored(),
        };
        let path = format!("/datanodes/{}/heartbeat", state.node_id);

        match state.namenode.post_ack(&path, &request).await {
            Ok(()) => {}
            Err(DfsError::NotFound(_)) => {
                tracing::warn!("namenode no longer knows this node; re-registering");
                match register(&config, &state.namenode).await {
                    Ok(_) => {
                        if let Err(err) = send_block_report(&state).await {
                            tracing::warn!("block report after re-registration failed: {err}");
                        }
                    }
                    Err(err) => tracing::warn!("re-registration failed: {err}"),
                }
            }
            Err(err) => {
                tracing::warn!("heartbeat failed: {err}");
            }
        }
    }
}
