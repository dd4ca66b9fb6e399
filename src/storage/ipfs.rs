/// IPFS content store via the Kubo HTTP API.
///
/// Every upload is added with `pin=true` and CIDv1 so the node keeps the
/// content and the identifier is stable across nodes. The CID returned in
/// the `Hash` field becomes an `ipfs://` reference.
///
/// Uses the IPFS HTTP API (typically Kubo at localhost:5001).
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{classify_status, transport_error, ContentStore};
use crate::anchor::ContentReference;
use crate::error::UploadError;

/// Configuration for IPFS HTTP API.
#[derive(Debug, Clone)]
pub struct IpfsConfig {
    /// IPFS API endpoint (e.g., "http://localhost:5001").
    pub api_url: String,
}

/// Kubo-backed content store.
pub struct IpfsStore {
    client: Client,
    config: IpfsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpfsAddResponse {
    hash: String,
    #[allow(dead_code)]
    size: String,
}

impl IpfsStore {
    pub fn new(config: IpfsConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn add(&self, data: Vec<u8>, file_name: &str) -> Result<ContentReference, UploadError> {
        let size = data.len();
        let part = multipart::Part::bytes(data).file_name(file_name.to_string());
        let form = multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(format!("{}/api/v0/add", self.config.api_url))
            .query(&[("pin", "true"), ("cid-version", "1")])
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error("IPFS", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status("IPFS", status, &body));
        }

        let add_resp: IpfsAddResponse = resp
            .json()
            .await
            .map_err(|e| UploadError::Transient(format!("IPFS response parse error: {e}")))?;

        debug!(cid = %add_resp.hash, size, file_name, "Added to IPFS");
        Ok(ContentReference::ipfs(&add_resp.hash))
    }
}

#[async_trait]
impl ContentStore for IpfsStore {
    fn name(&self) -> &str {
        "IPFS"
    }

    async fn put_bytes(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<ContentReference, UploadError> {
        self.add(bytes, filename).await
    }

    /// The document is added as a `<name>.json` file.
    async fn put_json(
        &self,
        document: &Value,
        name: &str,
    ) -> Result<ContentReference, UploadError> {
        let data = serde_json::to_vec(document)
            .map_err(|e| UploadError::Permanent(format!("Document is not serializable: {e}")))?;
        self.add(data, &format!("{name}.json")).await
    }
}
