/// In-memory content store.
///
/// Identifiers are derived from the BLAKE3 digest of the stored bytes, so
/// identical uploads produce identical references, as with a real
/// content-addressed store. Used by tests and by `STORAGE_BACKEND=memory`
/// for local development.
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::ContentStore;
use crate::anchor::ContentReference;
use crate::crypto::hash;
use crate::error::UploadError;

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, Vec<u8>>,
    injected_failures: VecDeque<UploadError>,
    uploads: usize,
    attempts: usize,
}

/// Content store that keeps everything in a map.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next upload attempt. Failures are consumed
    /// in order, one per attempt.
    pub async fn inject_failure(&self, err: UploadError) {
        self.state.lock().await.injected_failures.push_back(err);
    }

    /// Delay every upload by `delay`.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }

    /// Fetch stored bytes by CID.
    pub async fn get(&self, cid: &str) -> Option<Vec<u8>> {
        self.state.lock().await.objects.get(cid).cloned()
    }

    /// Fetch and parse a stored JSON document by CID.
    pub async fn get_json(&self, cid: &str) -> Option<Value> {
        let bytes = self.get(cid).await?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Number of successful uploads.
    pub async fn upload_count(&self) -> usize {
        self.state.lock().await.uploads
    }

    /// Number of upload attempts, including injected failures.
    pub async fn attempt_count(&self) -> usize {
        self.state.lock().await.attempts
    }

    async fn store(&self, data: Vec<u8>) -> Result<ContentReference, UploadError> {
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        state.attempts += 1;
        if let Some(err) = state.injected_failures.pop_front() {
            return Err(err);
        }

        let cid = format!("bafk{}", hex::encode(hash::content_digest(&data)));
        state.objects.insert(cid.clone(), data);
        state.uploads += 1;
        Ok(ContentReference::ipfs(&cid))
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    fn name(&self) -> &str {
        "Memory"
    }

    async fn put_bytes(
        &self,
        bytes: Vec<u8>,
        _filename: &str,
    ) -> Result<ContentReference, UploadError> {
        self.store(bytes).await
    }

    async fn put_json(
        &self,
        document: &Value,
        _name: &str,
    ) -> Result<ContentReference, UploadError> {
        let data = serde_json::to_vec(document)
            .map_err(|e| UploadError::Permanent(format!("Document is not serializable: {e}")))?;
        self.store(data).await
    }
}
