/// Anchoring of content references to ledger records.
///
/// An anchor binds an off-chain content reference (an `ipfs://` URI of a
/// metadata document) to an on-chain record together with its commitment
/// hash. Records can later be evolved to point at a new reference; the
/// ledger keeps the history.
///
/// ```text
/// image bytes ──▶ ContentStore ──▶ metadata JSON ──▶ ContentStore
///                                                       │ reference
///                                                       ▼
///                       HashBinder ──▶ LedgerClient ──▶ receipt ──▶ outcome
/// ```
///
/// The orchestrator is the only writer, and the only place that guarantees
/// `commitment == bind(reference)` for every confirmed record.
pub mod operation;
pub mod orchestrator;
pub mod registry;
pub mod retry;

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};

use crate::error::AnchorError;
use crate::metadata::{ImageUpload, PublishedContent};

pub use operation::{AnchorOperation, CancelOutcome, OperationHandle, OperationState};
pub use orchestrator::{
    verify_record, AnchorOrchestrator, OrchestratorConfig, RecordVerification, TransactionStatus,
};
pub use registry::{Admission, IdempotencyKey, InFlightRegistry};
pub use retry::RetryPolicy;

/// URI-like reference to content in a content-addressable store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentReference(String);

impl ContentReference {
    /// Validate a `scheme://identifier` reference.
    pub fn parse(raw: &str) -> Result<Self, AnchorError> {
        let invalid = || {
            AnchorError::Validation(format!(
                "'{raw}' is not a content reference of the form scheme://identifier"
            ))
        };

        let (scheme, rest) = raw.split_once("://").ok_or_else(invalid)?;

        let mut chars = scheme.chars();
        let scheme_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'));
        let rest_ok =
            !rest.is_empty() && !rest.chars().any(|c| c.is_whitespace() || c.is_control());

        if !scheme_ok || !rest_ok {
            return Err(invalid());
        }

        Ok(Self(raw.to_string()))
    }

    /// Wrap a value read back from the ledger. The contract stores whatever
    /// string it was given; an empty one means no record.
    pub(crate) fn from_ledger(raw: String) -> Option<Self> {
        (!raw.is_empty()).then_some(Self(raw))
    }

    /// Reference for an IPFS content identifier.
    pub fn ipfs(cid: &str) -> Self {
        Self(format!("ipfs://{cid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier after the scheme (the CID for `ipfs://` references).
    pub fn cid(&self) -> &str {
        self.0.split_once("://").map_or(self.0.as_str(), |(_, id)| id)
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 32-byte commitment stored on the ledger next to each reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitmentHash(B256);

impl CommitmentHash {
    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl From<B256> for CommitmentHash {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl From<[u8; 32]> for CommitmentHash {
    fn from(value: [u8; 32]) -> Self {
        Self(B256::from(value))
    }
}

impl fmt::Display for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ledger-assigned record (token) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(U256);

impl RecordId {
    pub fn as_u256(&self) -> U256 {
        self.0
    }
}

impl From<U256> for RecordId {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl FromStr for RecordId {
    type Err = AnchorError;

    /// Record ids travel as decimal strings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AnchorError::Validation(format!(
                "'{s}' is not a valid token id"
            )));
        }
        U256::from_str_radix(s, 10)
            .map(Self)
            .map_err(|_| AnchorError::Validation(format!("token id '{s}' is out of range")))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ledger transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(B256);

impl TxHash {
    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl From<B256> for TxHash {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl From<[u8; 32]> for TxHash {
    fn from(value: [u8; 32]) -> Self {
        Self(B256::from(value))
    }
}

impl FromStr for TxHash {
    type Err = AnchorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s.strip_prefix("0x").unwrap_or(s);
        if hex_part.len() != 64 {
            return Err(AnchorError::Validation(format!(
                "'{s}' is not a 32-byte transaction hash"
            )));
        }
        B256::from_str(hex_part)
            .map(Self)
            .map_err(|e| AnchorError::Validation(format!("invalid transaction hash '{s}': {e}")))
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which ledger call an operation ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => f.write_str("create"),
            OperationKind::Update => f.write_str("update"),
        }
    }
}

/// Where the reference to anchor comes from.
#[derive(Debug, Clone)]
pub enum ContentSource {
    /// Caller already holds a reference; the operation enters at `HASH_BOUND`.
    Reference(ContentReference),
    /// Image bytes plus metadata fields to upload first.
    Upload(ImageUpload),
}

/// A request to create or evolve a ledger record.
#[derive(Debug, Clone)]
pub enum AnchorRequest {
    Create {
        owner: Address,
        content: ContentSource,
    },
    Update {
        record_id: RecordId,
        content: ContentSource,
    },
}

impl AnchorRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            AnchorRequest::Create { .. } => OperationKind::Create,
            AnchorRequest::Update { .. } => OperationKind::Update,
        }
    }

    /// Identity the request acts on: owner for creates, record for updates.
    pub fn target(&self) -> String {
        match self {
            AnchorRequest::Create { owner, .. } => format!("{owner:#x}"),
            AnchorRequest::Update { record_id, .. } => record_id.to_string(),
        }
    }
}

/// Result of a confirmed anchor operation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorOutcome {
    pub kind: OperationKind,
    pub record_id: RecordId,
    pub reference: ContentReference,
    pub commitment: CommitmentHash,
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// Present when the operation uploaded the content itself.
    pub published: Option<PublishedContent>,
}
