//! # HTTP Storage Node
//!
//! [`StorageNode`] over a storage gateway's REST interface:
//!
//! | Method | Path                | Body / response                   |
//! |--------|---------------------|-----------------------------------|
//! | GET    | `/pointer/:name`    | `PointerRecord` JSON, 404 if none |
//! | PUT    | `/pointer/:name`    | `PointerRecord` JSON, 409 if stale|
//! | GET    | `/content/:address` | raw bytes, 404 if none            |
//! | POST   | `/content`          | raw bytes in, `{"address"}` out   |
//!
//! The gateway is not trusted: the resolver re-verifies pointer signatures
//! and content hashes, so this layer only maps transport outcomes onto
//! [`NodeError`].

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use tessera_protocol::storage::{ContentAddress, NodeError, PointerRecord, StorageNode};

use crate::config::NodeEndpoint;

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredResponse {
    pub address: ContentAddress,
}

pub struct HttpStorageNode {
    id: String,
    base_url: String,
    client: Client,
}

impl HttpStorageNode {
    pub fn new(endpoint: &NodeEndpoint, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id: endpoint.id.clone(),
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport_error(e: reqwest::Error) -> NodeError {
    if e.is_timeout() {
        NodeError::Timeout
    } else if e.is_decode() {
        NodeError::InvalidResponse(e.to_string())
    } else {
        NodeError::Unavailable(e.to_string())
    }
}

/// Maps non-success statuses. 5xx means "try another node", 4xx means the
/// gateway understood and refused.
async fn check(response: Response) -> Result<Response, NodeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };
    if status.is_server_error() {
        Err(NodeError::Unavailable(detail))
    } else {
        Err(NodeError::Rejected(detail))
    }
}

#[async_trait]
impl StorageNode for HttpStorageNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn resolve(&self, name: &str) -> Result<Option<PointerRecord>, NodeError> {
        let response = self
            .client
            .get(self.url(&format!("/pointer/{name}")))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = check(response)
            .await?
            .json::<PointerRecord>()
            .await
            .map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
        Ok(Some(record))
    }

    async fn fetch(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, NodeError> {
        let response = self
            .client
            .get(self.url(&format!("/content/{address}")))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = check(response).await?.bytes().await.map_err(transport_error)?;
        Ok(Some(bytes.to_vec()))
    }

    async fn store(&self, bytes: Vec<u8>) -> Result<ContentAddress, NodeError> {
        let response = self
            .client
            .post(self.url("/content"))
            .header("content-type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        let stored = check(response)
            .await?
            .json::<StoredResponse>()
            .await
            .map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
        Ok(stored.address)
    }

    async fn publish(&self, record: &PointerRecord) -> Result<(), NodeError> {
        let response = self
            .client
            .put(self.url(&format!("/pointer/{}", record.name)))
            .json(record)
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }
}
