//! File store that PUTs uploads to a remote HTTP endpoint (e.g. a CDN origin).

use crate::error::{StoreError, StoreResult};
use crate::storage::files::{object_path, FileStore, UploadOptions};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpFileStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFileStore {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FileStore for HttpFileStore {
    async fn upload(&self, name: &str, content: &[u8], options: &UploadOptions) -> StoreResult<String> {
        let url = format!("{}/{}", self.endpoint, object_path(options.variant.as_deref(), name));
        let resp = self
            .client
            .put(&url)
            .query(&[("overwrite", options.overwrite)])
            .body(content.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(StoreError::Duplicate(url));
        }
        if !status.is_success() {
            return Err(StoreError::Query(format!("upload to {} failed with {}", url, status)));
        }

        // Origins answering with {"uri": "..."} override the request URL.
        let body = resp.text().await.unwrap_or_default();
        let uri = serde_json::from_str::<JsonValue>(&body)
            .ok()
            .and_then(|v| v.get("uri").and_then(|u| u.as_str()).map(str::to_string))
            .unwrap_or(url);
        Ok(uri)
    }
}
