/// Ledger access for content-anchor.
///
/// The ledger holds one record per token: owner, current token URI and the
/// commitment hash of that URI. This module defines the narrow capability
/// the orchestrator needs from it, and two implementations:
/// - Ethereum: raw JSON-RPC with locally signed transactions
/// - In-memory: a deterministic stand-in for tests and local development
///
/// The ledger executes state transitions and assigns record ids; it never
/// re-derives commitments. That check belongs to the orchestrator.
pub mod ethereum;
pub mod memory;
pub mod receipt;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::anchor::{CommitmentHash, ContentReference, RecordId, TxHash};
use crate::error::LedgerError;

pub use receipt::ReceiptParser;

/// Contract surface the ledger adapters speak.
pub mod abi {
    alloy::sol! {
        function mint(address to, string uri, bytes32 uriHash) returns (uint256 tokenId);
        function evolve(uint256 tokenId, string newUri, bytes32 newHash);
        function tokenURI(uint256 tokenId) view returns (string uri);
        function metadataHash(uint256 tokenId) view returns (bytes32 commitment);

        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
    }
}

/// A transaction accepted by the node but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub tx_hash: TxHash,
    pub submitted_at: DateTime<Utc>,
}

impl PendingTx {
    pub fn new(tx_hash: TxHash) -> Self {
        Self {
            tx_hash,
            submitted_at: Utc::now(),
        }
    }
}

/// A single event emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Contract that emitted the event.
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Confirmation artifact for a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// False when the transaction was mined but reverted.
    pub success: bool,
    pub logs: Vec<LogEntry>,
}

/// Capability the orchestrator consumes from a ledger.
///
/// Submissions from one signer must not run concurrently; callers serialize
/// them. Reads have no ordering constraint.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Human-readable name of this ledger (e.g., "Ethereum").
    fn name(&self) -> &str;

    /// Address of the contract whose events identify created records.
    fn contract_address(&self) -> Address;

    async fn submit_create(
        &self,
        owner: Address,
        reference: &ContentReference,
        commitment: CommitmentHash,
    ) -> Result<PendingTx, LedgerError>;

    async fn submit_update(
        &self,
        record_id: RecordId,
        reference: &ContentReference,
        commitment: CommitmentHash,
    ) -> Result<PendingTx, LedgerError>;

    /// Current reference of a record. Unknown ids fail with `NotFound`.
    async fn read_uri(&self, record_id: RecordId) -> Result<ContentReference, LedgerError>;

    /// Commitment stored for a record as of `at_block`, or the latest block
    /// when `None`.
    async fn read_commitment(
        &self,
        record_id: RecordId,
        at_block: Option<u64>,
    ) -> Result<CommitmentHash, LedgerError>;

    /// Wait until the transaction is mined with `confirmations` blocks on
    /// top. Returns `Reverted` if it was mined but failed. Never returns on
    /// its own for a transaction that is not mined; callers bound the wait.
    async fn await_confirmation(
        &self,
        pending: &PendingTx,
        confirmations: u64,
    ) -> Result<Receipt, LedgerError>;

    /// Look up the receipt of a previously submitted transaction.
    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, LedgerError>;
}
