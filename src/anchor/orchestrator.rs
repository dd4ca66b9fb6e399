/// Anchoring orchestrator.
///
/// Drives each operation through its state machine:
/// 1. For updates, check that the record exists
/// 2. Upload the image and its metadata document (when bytes were supplied)
/// 3. Bind the metadata reference to its commitment hash
/// 4. Admit the operation in the in-flight registry (duplicates defer)
/// 5. Submit to the ledger through the single submission queue
/// 6. Wait for confirmation, bounded by the confirmation timeout
/// 7. Recover the record id and check the on-ledger commitment
///
/// No ledger record is reported as confirmed unless the ledger holds
/// exactly the commitment that was bound.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::operation::{AnchorOperation, OperationHandle, OperationState};
use super::registry::{Admission, IdempotencyKey, InFlightRegistry};
use super::retry::RetryPolicy;
use super::{
    AnchorOutcome, AnchorRequest, CommitmentHash, ContentReference, ContentSource, RecordId,
    TxHash,
};
use crate::crypto::hash;
use crate::error::{AnchorError, LedgerError, Result, UploadError};
use crate::ledger::{LedgerClient, PendingTx, ReceiptParser};
use crate::metadata::{ImageUpload, MetadataDocument, PublishedContent};
use crate::storage::ContentStore;

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Blocks required on top of the inclusion block.
    pub confirmations: u64,
    pub confirmation_timeout: Duration,
    pub retry: RetryPolicy,
    /// How long settled, submitted operations stay in the registry.
    pub retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            confirmations: 1,
            confirmation_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            retention: Duration::from_secs(60),
        }
    }
}

/// Ledger-side status of a previously submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Confirmed {
        block_number: u64,
        /// Present for transactions that created a record.
        record_id: Option<RecordId>,
    },
    Reverted {
        block_number: u64,
    },
}

/// Result of checking a record against its commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVerification {
    pub record_id: RecordId,
    pub reference: ContentReference,
    /// Commitment recomputed from the reference.
    pub expected: CommitmentHash,
    /// Commitment stored on the ledger.
    pub actual: CommitmentHash,
}

impl RecordVerification {
    pub fn is_valid(&self) -> bool {
        self.expected == self.actual
    }
}

/// Read a record's reference and stored commitment and compare them.
pub async fn verify_record(
    ledger: &dyn LedgerClient,
    retry: &RetryPolicy,
    record_id: RecordId,
) -> Result<RecordVerification> {
    let (reference, actual) = tokio::try_join!(
        retry.run("record read", LedgerError::is_transient, move || {
            ledger.read_uri(record_id)
        }),
        retry.run("commitment read", LedgerError::is_transient, move || {
            ledger.read_commitment(record_id, None)
        }),
    )?;

    Ok(RecordVerification {
        record_id,
        expected: hash::bind_reference(&reference),
        reference,
        actual,
    })
}

/// Coordinates content stores, the ledger and in-flight operations.
pub struct AnchorOrchestrator {
    store: Arc<dyn ContentStore>,
    ledger: Arc<dyn LedgerClient>,
    registry: InFlightRegistry,
    parser: ReceiptParser,
    config: OrchestratorConfig,
    /// Serializes submissions from the single signer.
    submissions: Mutex<()>,
}

/// Settles an operation whose task ended without settling it (panic or
/// abort), and releases its registry entry.
struct SettleOnDrop {
    orchestrator: Arc<AnchorOrchestrator>,
    op: OperationHandle,
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        if self.op.settle(Err(AnchorError::Internal(
            "operation task ended before settling".into(),
        ))) {
            error!(operation_id = %self.op.id(), "Anchor operation aborted");
        }
        if let Some(key) = self.op.key() {
            self.orchestrator
                .registry
                .retire(key, self.op.id(), self.op.reached_submission());
        }
    }
}

impl AnchorOrchestrator {
    pub fn new(
        store: Arc<dyn ContentStore>,
        ledger: Arc<dyn LedgerClient>,
        config: OrchestratorConfig,
    ) -> Self {
        info!(
            store = store.name(),
            ledger = ledger.name(),
            contract = %ledger.contract_address(),
            confirmations = config.confirmations,
            timeout_secs = config.confirmation_timeout.as_secs(),
            "Anchor orchestrator initialized"
        );

        Self {
            parser: ReceiptParser::new(ledger.contract_address()),
            registry: InFlightRegistry::new(config.retention),
            store,
            ledger,
            config,
            submissions: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    /// Start an operation in its own task and return its handle.
    pub fn submit(self: &Arc<Self>, request: AnchorRequest) -> OperationHandle {
        let op = AnchorOperation::new(request.kind());
        let guard = SettleOnDrop {
            orchestrator: Arc::clone(self),
            op: Arc::clone(&op),
        };

        tokio::spawn(async move {
            guard.orchestrator.run(&guard.op, request).await;
            drop(guard);
        });

        op
    }

    /// Start an operation and wait for its result.
    pub async fn anchor(self: &Arc<Self>, request: AnchorRequest) -> Result<AnchorOutcome> {
        self.submit(request).wait().await
    }

    /// Upload an image and its metadata document without touching the
    /// ledger.
    pub async fn publish(&self, upload: &ImageUpload) -> Result<PublishedContent> {
        upload.validate()?;
        let image = self.upload_image(upload).await?;
        let metadata = MetadataDocument::assemble(&image, &upload.fields);
        let metadata_uri = self.upload_metadata(&metadata).await?;

        Ok(PublishedContent {
            image,
            metadata_uri,
            metadata,
        })
    }

    /// Current reference of a record.
    pub async fn read_reference(&self, record_id: RecordId) -> Result<ContentReference> {
        let reference = self
            .config
            .retry
            .run("record read", LedgerError::is_transient, move || {
                self.ledger.read_uri(record_id)
            })
            .await?;
        Ok(reference)
    }

    /// Read a record and recompute its commitment.
    pub async fn verify_record(&self, record_id: RecordId) -> Result<RecordVerification> {
        verify_record(self.ledger.as_ref(), &self.config.retry, record_id).await
    }

    /// Re-query a transaction by hash.
    pub async fn transaction_status(&self, tx_hash: TxHash) -> Result<TransactionStatus> {
        let receipt = self
            .config
            .retry
            .run("receipt lookup", LedgerError::is_transient, move || {
                self.ledger.receipt(tx_hash)
            })
            .await?;

        Ok(match receipt {
            None => TransactionStatus::Pending,
            Some(receipt) if !receipt.success => TransactionStatus::Reverted {
                block_number: receipt.block_number,
            },
            Some(receipt) => TransactionStatus::Confirmed {
                block_number: receipt.block_number,
                record_id: self.parser.parse_created_id(&receipt).ok(),
            },
        })
    }

    async fn run(&self, op: &OperationHandle, request: AnchorRequest) {
        let kind = request.kind();
        info!(
            operation_id = %op.id(),
            kind = %kind,
            target = %request.target(),
            "Anchor operation started"
        );

        let result = self.drive(op, &request).await;

        match &result {
            Ok(outcome) => info!(
                operation_id = %op.id(),
                kind = %kind,
                record_id = %outcome.record_id,
                tx_hash = %outcome.tx_hash,
                block = outcome.block_number,
                abandoned = op.is_abandoned(),
                "Anchor operation confirmed"
            ),
            Err(e) => warn!(
                operation_id = %op.id(),
                kind = %kind,
                state = %op.state(),
                tx_hash = ?e.tx_hash().map(ToString::to_string),
                error = %e,
                "Anchor operation failed"
            ),
        }

        op.settle(result);
    }

    async fn drive(&self, op: &OperationHandle, request: &AnchorRequest) -> Result<AnchorOutcome> {
        let content = match request {
            AnchorRequest::Create { content, .. } => content,
            AnchorRequest::Update { record_id, content } => {
                // Unknown records fail before anything is uploaded.
                let record_id = *record_id;
                op.interruptible(self.read_reference(record_id)).await?;
                content
            }
        };

        let (reference, published) = match content {
            ContentSource::Reference(reference) => (reference.clone(), None),
            ContentSource::Upload(upload) => {
                let published = self.publish_tracked(op, upload).await?;
                (published.metadata_uri.clone(), Some(published))
            }
        };

        let commitment = hash::bind_reference(&reference);
        op.advance(OperationState::HashBound)?;
        debug!(
            operation_id = %op.id(),
            reference = %reference,
            commitment = %commitment,
            "Hash bound"
        );

        let key = IdempotencyKey::for_request(request, commitment);
        op.bind_key(key.clone());
        if let Admission::AlreadyInFlight(original) = self.registry.register(key, op) {
            info!(
                operation_id = %op.id(),
                original = %original.id(),
                "Identical operation in flight, deferring"
            );
            let result = op.interruptible(original.wait()).await;
            op.settle_as_duplicate(original.id(), result.clone());
            return result;
        }

        let pending = self
            .submit_serialized(op, request, &reference, commitment)
            .await?;

        let receipt = match tokio::time::timeout(
            self.config.confirmation_timeout,
            self.ledger
                .await_confirmation(&pending, self.config.confirmations),
        )
        .await
        {
            Ok(receipt) => receipt?,
            Err(_) => {
                return Err(LedgerError::Timeout {
                    tx_hash: pending.tx_hash,
                }
                .into())
            }
        };

        let record_id = match request {
            AnchorRequest::Create { .. } => self.parser.parse_created_id(&receipt)?,
            AnchorRequest::Update { record_id, .. } => *record_id,
        };

        let mined_in = receipt.block_number;
        let actual = self
            .config
            .retry
            .run("commitment read", LedgerError::is_transient, move || {
                self.ledger.read_commitment(record_id, Some(mined_in))
            })
            .await?;
        if actual != commitment {
            return Err(AnchorError::HashMismatch {
                record_id,
                tx_hash: pending.tx_hash,
                expected: commitment,
                actual,
            });
        }

        Ok(AnchorOutcome {
            kind: request.kind(),
            record_id,
            reference,
            commitment,
            tx_hash: pending.tx_hash,
            block_number: receipt.block_number,
            published,
        })
    }

    /// Wait for the submission queue, pass the commit point and broadcast.
    async fn submit_serialized(
        &self,
        op: &AnchorOperation,
        request: &AnchorRequest,
        reference: &ContentReference,
        commitment: CommitmentHash,
    ) -> Result<PendingTx> {
        let _queue = op
            .interruptible(async { Ok(self.submissions.lock().await) })
            .await?;

        op.advance(OperationState::Submitted)?;

        let pending = self
            .config
            .retry
            .run("ledger submission", LedgerError::is_transient, move || async move {
                match request {
                    AnchorRequest::Create { owner, .. } => {
                        self.ledger
                            .submit_create(*owner, reference, commitment)
                            .await
                    }
                    AnchorRequest::Update { record_id, .. } => {
                        self.ledger
                            .submit_update(*record_id, reference, commitment)
                            .await
                    }
                }
            })
            .await?;

        op.record_tx(pending.tx_hash);
        info!(
            operation_id = %op.id(),
            tx_hash = %pending.tx_hash,
            "Transaction submitted"
        );
        Ok(pending)
    }

    /// Content phase of an operation, with state tracking and cancellation.
    async fn publish_tracked(
        &self,
        op: &AnchorOperation,
        upload: &ImageUpload,
    ) -> Result<PublishedContent> {
        upload.validate()?;
        op.advance(OperationState::ContentPending)?;

        let image = op.interruptible(self.upload_image(upload)).await?;
        op.advance(OperationState::ContentUploaded)?;

        let metadata = MetadataDocument::assemble(&image, &upload.fields);
        op.advance(OperationState::MetadataAssembled)?;

        let metadata_uri = op.interruptible(self.upload_metadata(&metadata)).await?;
        op.advance(OperationState::MetadataUploaded)?;

        debug!(
            operation_id = %op.id(),
            image = %image,
            metadata_uri = %metadata_uri,
            "Content published"
        );

        Ok(PublishedContent {
            image,
            metadata_uri,
            metadata,
        })
    }

    async fn upload_image(&self, upload: &ImageUpload) -> Result<ContentReference> {
        let reference = self
            .config
            .retry
            .run("image upload", UploadError::is_transient, move || {
                self.store
                    .put_bytes(upload.bytes.clone(), &upload.filename)
            })
            .await?;
        Ok(reference)
    }

    async fn upload_metadata(&self, metadata: &MetadataDocument) -> Result<ContentReference> {
        let document = metadata.to_value()?;
        let name = if metadata.name.is_empty() {
            "metadata".to_string()
        } else {
            format!("{} metadata", metadata.name)
        };
        let (document, name) = (&document, name.as_str());

        let reference = self
            .config
            .retry
            .run("metadata upload", UploadError::is_transient, move || {
                self.store.put_json(document, name)
            })
            .await?;
        Ok(reference)
    }
}
