use thiserror::Error;

use crate::anchor::{CommitmentHash, RecordId, TxHash};

/// Failure reported by a content store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Network failure, rate limiting or a 5xx from the provider.
    #[error("Storage provider unavailable: {0}")]
    Transient(String),

    /// The provider rejected the payload (oversize, malformed, unauthorized).
    #[error("Upload rejected: {0}")]
    Permanent(String),
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transient(_))
    }
}

/// Failure reported by a ledger client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// RPC or network failure before or during broadcast.
    #[error("Ledger unavailable: {0}")]
    Transient(String),

    /// The ledger rejected the state transition. `tx_hash` is set when the
    /// transaction was mined and reverted on-chain.
    #[error("Transaction reverted: {reason}")]
    Reverted {
        reason: String,
        tx_hash: Option<TxHash>,
    },

    /// The confirmation wait was abandoned. The transaction may still land.
    #[error("Timed out waiting for confirmation of transaction {tx_hash}")]
    Timeout { tx_hash: TxHash },

    #[error("Record {0} not found")]
    NotFound(RecordId),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }

    /// A rejection that never reached a block.
    pub fn reverted(reason: impl Into<String>) -> Self {
        LedgerError::Reverted {
            reason: reason.into(),
            tx_hash: None,
        }
    }
}

/// Every way an anchor operation can end without confirming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnchorError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Ledger(LedgerError),

    /// The transaction succeeded but its receipt carries no creation event.
    #[error("Transaction {tx_hash} confirmed without a creation event: {reason}")]
    Parse { tx_hash: TxHash, reason: String },

    #[error(
        "Commitment mismatch for record {record_id}: bound {expected}, ledger holds {actual}"
    )]
    HashMismatch {
        record_id: RecordId,
        tx_hash: TxHash,
        expected: CommitmentHash,
        actual: CommitmentHash,
    },

    #[error("Record {0} not found")]
    NotFound(RecordId),

    #[error("Operation cancelled before submission")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnchorError {
    /// Transaction identifier retained by failures that happened after
    /// submission, so callers can re-query instead of resubmitting.
    pub fn tx_hash(&self) -> Option<&TxHash> {
        match self {
            AnchorError::Ledger(LedgerError::Timeout { tx_hash })
            | AnchorError::Parse { tx_hash, .. }
            | AnchorError::HashMismatch { tx_hash, .. } => Some(tx_hash),
            AnchorError::Ledger(LedgerError::Reverted { tx_hash, .. }) => tx_hash.as_ref(),
            _ => None,
        }
    }
}

impl From<LedgerError> for AnchorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(record_id) => AnchorError::NotFound(record_id),
            other => AnchorError::Ledger(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnchorError>;
