//! Data-plane client: framed block transfer against storage nodes.

use basalt_core::checksum::verify_checksum;
use basalt_core::error::{DfsError, Result};
use basalt_core::settings::Settings;
use basalt_core::types::{CheckBlockResponse, ErrorBody, FollowerHint, StoreBlockResponse};
use basalt_core::wire::{split_into_frames, BlockAssembler, FrameDecoder};
use bytes::Bytes;
use futures::StreamExt;
use uuid::Uuid;

const FOLLOWERS_HEADER: &str = "x-basalt-followers";

pub struct DataNodeClient {
    client: reqwest::Client,
    settings: Settings,
}

impl DataNodeClient {
    pub fn new(settings: Settings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    /// Stream a block to a storage node. `followers` rides along as RPC
    /// metadata so the receiving leader can start replication immediately.
    pub async fn store_block(
        &self,
        endpoint: &str,
        block_id: Uuid,
        data: Bytes,
        followers: &[FollowerHint],
    ) -> Result<StoreBlockResponse> {
        let frames = split_into_frames(
            block_id,
            &data,
            self.settings.max_frame_bytes,
            self.settings.wire_compression,
        )?;
        let stream = futures::stream::iter(
            frames
                .into_iter()
                .map(Ok::<Bytes, std::convert::Infallible>),
        );

        let mut request = self
            .client
            .put(format!("{endpoint}/blocks/{block_id}"))
            .timeout(self.settings.block_deadline(data.len() as u64))
            .body(reqwest::Body::wrap_stream(stream));
        if !followers.is_empty() {
            request = request.header(FOLLOWERS_HEADER, serde_json::to_string(followers)?);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DfsError::Transient(format!("store rpc to {endpoint} failed: {e}")))?;
        let response = check(response).await?;
        response.json().await.map_err(DfsError::http)
    }

    /// Fetch a block and verify it against the expected digest when one is
    /// known.
    pub async fn retrieve_block(
        &self,
        endpoint: &str,
        block_id: Uuid,
        expected_checksum: Option<&str>,
        size_hint: u64,
    ) -> Result<Bytes> {
        let response = self
            .client
            .get(format!("{endpoint}/blocks/{block_id}"))
            .timeout(self.settings.block_deadline(size_hint))
            .send()
            .await
            .map_err(|e| DfsError::Transient(format!("retrieve rpc to {endpoint} failed: {e}")))?;
        let response = check(response).await?;

        let mut decoder = FrameDecoder::new(self.settings.max_frame_bytes);
        let mut assembler = BlockAssembler::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| DfsError::Transient(format!("stream from {endpoint}: {e}")))?;
            decoder.push(&chunk);
            while let Some(frame) = decoder.next_frame()? {
                assembler.accept(frame)?;
            }
        }
        let (_, data) = assembler.into_bytes()?;

        if let Some(expected) = expected_checksum {
            verify_checksum(&block_id.to_string(), &data, expected)?;
        }
        Ok(data)
    }

    pub async fn check_block(&self, endpoint: &str, block_id: Uuid) -> Result<CheckBlockResponse> {
        let response = self
            .client
            .get(format!("{endpoint}/blocks/{block_id}/check"))
            .timeout(std::time::Duration::from_secs(self.settings.rpc_timeout_secs))
            .send()
            .await
            .map_err(|e| DfsError::Transient(format!("check rpc to {endpoint} failed: {e}")))?;
        let response = check(response).await?;
        response.json().await.map_err(DfsError::http)
    }

    /// Best-effort removal used for upload rollback.
    pub async fn delete_block(&self, endpoint: &str, block_id: Uuid) -> Result<()> {
        let response = self
            .client
            .delete(format!("{endpoint}/blocks/{block_id}"))
            .timeout(std::time::Duration::from_secs(self.settings.rpc_timeout_secs))
            .send()
            .await
            .map_err(|e| DfsError::Transient(format!("delete rpc to {endpoint} failed: {e}")))?;
        check(response).await.map(|_| ())
    }
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
