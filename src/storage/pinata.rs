/// Pinata pinning service store.
///
/// Pinata pins content to IPFS on our behalf:
/// - files go through `POST /pinning/pinFileToIPFS` (multipart)
/// - JSON documents go through `POST /pinning/pinJSONToIPFS`
///
/// Both return the CID in the `IpfsHash` field. Requests authenticate with
/// a scoped JWT.
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{classify_status, transport_error, ContentStore};
use crate::anchor::ContentReference;
use crate::error::UploadError;

/// Default Pinata API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.pinata.cloud";

/// Configuration for Pinata access.
#[derive(Debug, Clone)]
pub struct PinataConfig {
    /// API endpoint (e.g., "https://api.pinata.cloud").
    pub api_url: String,
    /// JWT issued by Pinata for pinning.
    pub jwt: String,
}

/// Pinata-backed content store.
pub struct PinataStore {
    client: Client,
    config: PinataConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinResponse {
    ipfs_hash: String,
    #[serde(default)]
    pin_size: Option<u64>,
}

impl PinataStore {
    pub fn new(config: PinataConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn read_pin(resp: reqwest::Response) -> Result<ContentReference, UploadError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status("Pinata", status, &body));
        }

        let pin: PinResponse = resp
            .json()
            .await
            .map_err(|e| UploadError::Transient(format!("Pinata response parse error: {e}")))?;

        debug!(cid = %pin.ipfs_hash, size = ?pin.pin_size, "Pinned to IPFS");
        Ok(ContentReference::ipfs(&pin.ipfs_hash))
    }
}

#[async_trait]
impl ContentStore for PinataStore {
    fn name(&self) -> &str {
        "Pinata"
    }

    async fn put_bytes(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<ContentReference, UploadError> {
        let part = multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(format!("{}/pinning/pinFileToIPFS", self.config.api_url))
            .bearer_auth(&self.config.jwt)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error("Pinata", e))?;

        Self::read_pin(resp).await
    }

    async fn put_json(
        &self,
        document: &Value,
        name: &str,
    ) -> Result<ContentReference, UploadError> {
        let body = json!({
            "pinataContent": document,
            "pinataMetadata": { "name": name },
        });

        let resp = self
            .client
            .post(format!("{}/pinning/pinJSONToIPFS", self.config.api_url))
            .bearer_auth(&self.config.jwt)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Pinata", e))?;

        Self::read_pin(resp).await
    }
}
