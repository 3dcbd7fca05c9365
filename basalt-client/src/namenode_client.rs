//! Control-plane client.
//!
//! Talks to the configured namenode endpoints, follows `NOT_LEADER`
//! redirects (the error details name the current leader), and rotates to
//! the next endpoint on transport failures.

use basalt_core::error::{DfsError, Result};
use basalt_core::types::{
    BlockAssignment, BlockInfo, ClusterStatus, CreateDirectoryRequest, CreateFileRequest,
    DataNodeInfo, DirectoryListing, DirectoryMeta, ErrorBody, FileMeta, LocationRequest,
    PlacementRequest, PlacementSpec, RegisterBlockRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub struct NameNodeClient {
    endpoints: Vec<String>,
    /// Leader endpoint learned from a redirect, preferred until it fails.
    leader: Mutex<Option<String>>,
    client: reqwest::Client,
    timeout: Duration,
}

enum Body<'a, B: Serialize> {
    None,
    Json(&'a B),
}

impl NameNodeClient {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Self {
        Self {
            endpoints,
            leader: Mutex::new(None),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    // === namespace ===

    pub async fn create_directory(
        &self,
        path: &str,
        owner: Option<String>,
    ) -> Result<DirectoryMeta> {
        let request = CreateDirectoryRequest {
            path: path.to_string(),
            owner,
        };
        self.post_json("/directories", &request).await
    }

    pub async fn remove_directory(&self, path: &str, recursive: bool) -> Result<()> {
        let path = format!(
            "/directories/{}?recursive={recursive}",
            urlencoding::encode(path)
        );
        self.execute::<()>(reqwest::Method::DELETE, &path, Body::None)
            .await
            .map(|_| ())
    }

    pub async fn list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let path = format!("/directories/{}", urlencoding::encode(path));
        self.get_json(&path).await
    }

    pub async fn create_file(
        &self,
        path: &str,
        size: u64,
        owner: Option<String>,
    ) -> Result<FileMeta> {
        let request = CreateFileRequest {
            path: path.to_string(),
            size,
            owner,
        };
        self.post_json("/files", &request).await
    }

    pub async fn get_file_by_path(&self, path: &str) -> Result<FileMeta> {
        let path = format!("/files/path/{}", urlencoding::encode(path));
        self.get_json(&path).await
    }

    pub async fn get_file(&self, file_id: Uuid) -> Result<FileMeta> {
        self.get_json(&format!("/files/{file_id}")).await
    }

    pub async fn delete_file(&self, file_id: Uuid) -> Result<()> {
        self.execute::<()>(
            reqwest::Method::DELETE,
            &format!("/files/{file_id}"),
            Body::None,
        )
        .await
        .map(|_| ())
    }

    // === blocks ===

    pub async fn file_blocks(&self, file_id: Uuid) -> Result<Vec<BlockInfo>> {
        self.get_json(&format!("/blocks/file/{file_id}")).await
    }

    pub async fn get_block(&self, block_id: Uuid) -> Result<BlockInfo> {
        self.get_json(&format!("/blocks/{block_id}")).await
    }

    pub async fn register_block(&self, request: &RegisterBlockRequest) -> Result<()> {
        self.post_ack("/blocks", request).await
    }

    pub async fn add_location(
        &self,
        block_id: Uuid,
        node_id: Uuid,
        is_leader: bool,
    ) -> Result<()> {
        let request = LocationRequest { node_id, is_leader };
        self.post_ack(&format!("/blocks/{block_id}/locations"), &request)
            .await
    }

    pub async fn remove_location(&self, block_id: Uuid, node_id: Uuid) -> Result<()> {
        self.execute::<()>(
            reqwest::Method::DELETE,
            &format!("/blocks/{block_id}/locations/{node_id}"),
            Body::None,
        )
        .await
        .map(|_| ())
    }

    // === placement and cluster ===

    pub async fn placement(
        &self,
        blocks: Vec<PlacementSpec>,
        replication_factor: Option<u32>,
    ) -> Result<Vec<BlockAssignment>> {
        let request = PlacementRequest {
            blocks,
            replication_factor,
        };
        self.post_json("/placement", &request).await
    }

    pub async fn list_datanodes(&self, status: Option<&str>) -> Result<Vec<DataNodeInfo>> {
        let path = match status {
            Some(status) => format!("/datanodes?status={status}"),
            None => "/datanodes".to_string(),
        };
        self.get_json(&path).await
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        self.get_json("/status").await
    }

    // === transport ===

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .execute::<()>(reqwest::Method::GET, path, Body::None)
            .await?;
        response.json().await.map_err(DfsError::http)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .execute(reqwest::Method::POST, path, Body::Json(body))
            .await?;
        response.json().await.map_err(DfsError::http)
    }

    async fn post_ack<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        self.execute(reqwest::Method::POST, path, Body::Json(body))
            .await
            .map(|_| ())
    }

    fn preferred_endpoints(&self) -> Vec<String> {
        let mut ordered = Vec::with_capacity(self.endpoints.len() + 1);
        if let Ok(leader) = self.leader.lock() {
            if let Some(leader) = leader.clone() {
                ordered.push(leader);
            }
        }
        for endpoint in &self.endpoints {
            if !ordered.contains(endpoint) {
                ordered.push(endpoint.clone());
            }
        }
        ordered
    }

    fn remember_leader(&self, endpoint: Option<String>) {
        if let Ok(mut leader) = self.leader.lock() {
            *leader = endpoint;
        }
    }

    async fn execute<B: Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Body<'_, B>,
    ) -> Result<reqwest::Response> {
        let mut last_err = DfsError::Transient("no namenode endpoints configured".to_string());

        // Two passes: the second picks up a leader hint learned in the
        // first.
        for _ in 0..2 {
            for endpoint in self.preferred_endpoints() {
                let url = format!("{endpoint}{path}");
                let mut request = self
                    .client
                    .request(method.clone(), &url)
                    .timeout(self.timeout);
                if let Body::Json(json) = &body {
                    request = request.json(json);
                }

                match request.send().await {
                    Ok(response) => match Self::check(response).await {
                        Ok(response) => {
                            self.remember_leader(Some(endpoint));
                            return Ok(response);
                        }
                        Err(DfsError::NotLeader { leader }) => {
                            self.remember_leader(leader.clone());
                            last_err = DfsError::NotLeader { leader };
                        }
                        Err(err) => return Err(err),
                    },
                    Err(err) => {
                        self.remember_leader(None);
                        last_err = DfsError::Transient(format!("{url}: {err}"));
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
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
}
