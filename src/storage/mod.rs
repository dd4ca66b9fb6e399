/// Pluggable content store abstraction for content-anchor.
///
/// Content stores persist image bytes and metadata documents and hand back
/// a content reference. The orchestrator only ever sees references:
/// - Pinata (hosted IPFS pinning, the default provider)
/// - Kubo (self-hosted IPFS node via its HTTP API)
/// - In-memory (tests and local development)
///
/// Stores are not assumed to deduplicate retried uploads. The orchestrator
/// retries transient failures a bounded number of times.
pub mod ipfs;
pub mod memory;
pub mod pinata;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::anchor::ContentReference;
use crate::error::UploadError;

/// Trait for pluggable content stores.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Human-readable name of this store (e.g., "Pinata", "IPFS").
    fn name(&self) -> &str;

    /// Upload raw bytes (an image). Returns the reference to the content.
    async fn put_bytes(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<ContentReference, UploadError>;

    /// Upload a JSON document. `name` labels the upload where the provider
    /// supports it.
    async fn put_json(&self, document: &Value, name: &str)
        -> Result<ContentReference, UploadError>;
}

/// Classify a non-success HTTP status from a storage provider.
pub(crate) fn classify_status(provider: &str, status: StatusCode, body: &str) -> UploadError {
    let message = format!("{provider} returned {status}: {body}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        UploadError::Transient(message)
    } else {
        UploadError::Permanent(message)
    }
}

/// Errors raised before a response arrives are always worth retrying.
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> UploadError {
    UploadError::Transient(format!("{provider} request failed: {err}"))
}
