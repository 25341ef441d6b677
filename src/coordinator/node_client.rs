//! Outbound HTTP client for storage nodes
//!
//! The node contract: chunk payloads travel base64-encoded in JSON, reads
//! and existence probes are query-string GETs, writes are JSON POSTs.
//! File ids are opaque strings, so they are percent-encoded before being
//! placed in a query string. Every call carries the configured connect
//! and read timeouts; failures surface as `Error::NodeHttp` and drive
//! failover at the repair layer.

use crate::common::{encode_file_id, Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
struct ReadChunkResponse {
    data: String,
    #[serde(default)]
    #[allow(dead_code)]
    size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteChunkRequest<'a> {
    file_id: &'a str,
    chunk_index: u32,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    exists: bool,
}

/// A chunk read off a node: still base64, plus its decoded length.
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub data: String,
    pub bytes: usize,
}

#[derive(Clone)]
pub struct NodeClient {
    client: Client,
}

impl NodeClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Read one chunk. The payload is validated as base64 before it is
    /// handed to the repair path.
    pub async fn read_chunk(
        &self,
        node_url: &str,
        file_id: &str,
        chunk_index: u32,
    ) -> Result<ChunkData> {
        let url = format!(
            "{}/chunk/read?fileId={}&chunkIndex={}",
            node_url,
            encode_file_id(file_id),
            chunk_index
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::NodeHttp(format!("read {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::NodeHttp(format!(
                "read {}: HTTP {}",
                url,
                response.status()
            )));
        }

        let body: ReadChunkResponse = response
            .json()
            .await
            .map_err(|e| Error::NodeHttp(format!("read {}: {}", url, e)))?;

        let bytes = BASE64
            .decode(&body.data)
            .map_err(|e| Error::NodeHttp(format!("read {}: invalid base64: {}", url, e)))?
            .len();

        Ok(ChunkData {
            data: body.data,
            bytes,
        })
    }

    /// Write one chunk (base64 payload) to a node.
    pub async fn write_chunk(
        &self,
        node_url: &str,
        file_id: &str,
        chunk_index: u32,
        data: &str,
    ) -> Result<()> {
        let url = format!("{}/chunk/write", node_url);
        let request = WriteChunkRequest {
            file_id,
            chunk_index,
            data,
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::NodeHttp(format!("write {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::NodeHttp(format!(
                "write {} chunk {} of {}: HTTP {}",
                url,
                chunk_index,
                file_id,
                response.status()
            )));
        }
        Ok(())
    }

    /// Delete one chunk replica from a node.
    pub async fn delete_chunk(
        &self,
        node_url: &str,
        file_id: &str,
        chunk_index: u32,
    ) -> Result<()> {
        let url = format!(
            "{}/chunk/delete?fileId={}&chunkIndex={}",
            node_url,
            encode_file_id(file_id),
            chunk_index
        );
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::NodeHttp(format!("delete {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::NodeHttp(format!(
                "delete {}: HTTP {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Probe whether a node actually holds a chunk. Any failure counts as
    /// absent, so stale metadata never nominates a broken source.
    pub async fn chunk_exists(&self, node_url: &str, file_id: &str, chunk_index: u32) -> bool {
        let url = format!(
            "{}/chunk/exists?fileId={}&chunkIndex={}",
            node_url,
            encode_file_id(file_id),
            chunk_index
        );
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<ExistsResponse>()
                .await
                .map(|r| r.exists)
                .unwrap_or(false),
            _ => false,
        }
    }
}
