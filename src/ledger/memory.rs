/// In-memory ledger.
///
/// Behaves like the anchoring contract: ids start at 1, `mint` emits a
/// `Transfer` from the zero address, `evolve` of an unknown id reverts.
/// Every submission mines its own block immediately.
///
/// Commitments keep their history per block, so reads can be pinned to the
/// block a receipt was mined in.
///
/// Faults can be injected to exercise the orchestrator's failure paths:
/// transient submission errors, receipts that never arrive, mints without
/// events, commitments altered on write, transactions that revert on-chain,
/// and slow confirmations.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use alloy::primitives::{keccak256, Address, Bytes, B256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::abi::Transfer;
use super::{LedgerClient, LogEntry, PendingTx, Receipt};
use crate::anchor::{CommitmentHash, ContentReference, RecordId, TxHash};
use crate::crypto::hash;
use crate::error::LedgerError;

/// Contract address reported by the in-memory ledger.
pub const MEMORY_CONTRACT: Address = Address::repeat_byte(0xa1);

/// A record as the ledger stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub owner: Address,
    pub reference: ContentReference,
    pub commitment: CommitmentHash,
}

#[derive(Default)]
struct LedgerState {
    records: BTreeMap<RecordId, StoredRecord>,
    /// `(block, commitment)` per record, oldest first.
    history: BTreeMap<RecordId, Vec<(u64, CommitmentHash)>>,
    receipts: HashMap<TxHash, Receipt>,
    next_id: u64,
    block: u64,
    submissions: usize,
    injected_failures: VecDeque<LedgerError>,
    withhold_receipts: bool,
    omit_events: bool,
    tamper_commitments: bool,
    fail_execution: bool,
    confirmation_delay: Option<Duration>,
}

/// Ledger that keeps records in a map.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                next_id: 1,
                block: 1,
                ..Default::default()
            }),
        }
    }

    /// Fail the next submission with `err`. Queued failures are consumed in
    /// order, one per submission.
    pub async fn inject_submit_failure(&self, err: LedgerError) {
        self.state.lock().await.injected_failures.push_back(err);
    }

    /// Accept transactions but never confirm them.
    pub async fn set_withhold_receipts(&self, withhold: bool) {
        self.state.lock().await.withhold_receipts = withhold;
    }

    /// Mint without emitting a `Transfer` event.
    pub async fn set_omit_events(&self, omit: bool) {
        self.state.lock().await.omit_events = omit;
    }

    /// Store a commitment different from the one submitted.
    pub async fn set_tamper_commitments(&self, tamper: bool) {
        self.state.lock().await.tamper_commitments = tamper;
    }

    /// Mine submissions as reverted transactions that change nothing.
    pub async fn set_fail_execution(&self, fail: bool) {
        self.state.lock().await.fail_execution = fail;
    }

    /// Delay every confirmation by `delay`.
    pub async fn set_confirmation_delay(&self, delay: Duration) {
        self.state.lock().await.confirmation_delay = Some(delay);
    }

    /// Number of submissions that reached the ledger, including failed ones.
    pub async fn submission_count(&self) -> usize {
        self.state.lock().await.submissions
    }

    pub async fn record(&self, record_id: RecordId) -> Option<StoredRecord> {
        self.state.lock().await.records.get(&record_id).cloned()
    }

    /// Create a record directly, bypassing submission.
    pub async fn seed_record(
        &self,
        owner: Address,
        reference: ContentReference,
        commitment: CommitmentHash,
    ) -> RecordId {
        let mut state = self.state.lock().await;
        let record_id = RecordId::from(state.next_id);
        state.next_id += 1;
        let block = state.block;
        state.records.insert(
            record_id,
            StoredRecord {
                owner,
                reference,
                commitment,
            },
        );
        Self::remember(&mut state, record_id, block, commitment);
        record_id
    }

    fn tx_hash(state: &LedgerState, call: &str) -> TxHash {
        let seed = format!("{}:{}:{}", state.submissions, state.block, call);
        TxHash::from(hash::content_digest(seed.as_bytes()))
    }

    /// Common bookkeeping before a submission executes.
    fn begin_submission(state: &mut LedgerState) -> Result<(), LedgerError> {
        state.submissions += 1;
        match state.injected_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stored_commitment(state: &LedgerState, commitment: CommitmentHash) -> CommitmentHash {
        if state.tamper_commitments {
            CommitmentHash::from(keccak256(commitment.as_b256()))
        } else {
            commitment
        }
    }

    fn remember(
        state: &mut LedgerState,
        record_id: RecordId,
        block: u64,
        commitment: CommitmentHash,
    ) {
        state
            .history
            .entry(record_id)
            .or_default()
            .push((block, commitment));
    }

    fn mine(
        state: &mut LedgerState,
        tx_hash: TxHash,
        success: bool,
        logs: Vec<LogEntry>,
    ) -> PendingTx {
        state.block += 1;
        let receipt = Receipt {
            tx_hash,
            block_number: state.block,
            success,
            logs,
        };
        state.receipts.insert(tx_hash, receipt);
        PendingTx::new(tx_hash)
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    fn name(&self) -> &str {
        "Memory"
    }

    fn contract_address(&self) -> Address {
        MEMORY_CONTRACT
    }

    async fn submit_create(
        &self,
        owner: Address,
        reference: &ContentReference,
        commitment: CommitmentHash,
    ) -> Result<PendingTx, LedgerError> {
        let mut state = self.state.lock().await;
        Self::begin_submission(&mut state)?;

        let tx_hash = Self::tx_hash(&state, reference.as_str());
        if state.fail_execution {
            debug!(tx_hash = %tx_hash, "Mint reverted in memory");
            return Ok(Self::mine(&mut state, tx_hash, false, Vec::new()));
        }

        let record_id = RecordId::from(state.next_id);
        state.next_id += 1;
        let stored = Self::stored_commitment(&state, commitment);
        let block = state.block + 1;
        state.records.insert(
            record_id,
            StoredRecord {
                owner,
                reference: reference.clone(),
                commitment: stored,
            },
        );
        Self::remember(&mut state, record_id, block, stored);

        let logs = if state.omit_events {
            Vec::new()
        } else {
            vec![LogEntry {
                address: MEMORY_CONTRACT,
                topics: vec![
                    Transfer::SIGNATURE_HASH,
                    Address::ZERO.into_word(),
                    owner.into_word(),
                    B256::from(record_id.as_u256().to_be_bytes::<32>()),
                ],
                data: Bytes::new(),
            }]
        };

        debug!(record_id = %record_id, tx_hash = %tx_hash, "Minted record in memory");
        Ok(Self::mine(&mut state, tx_hash, true, logs))
    }

    async fn submit_update(
        &self,
        record_id: RecordId,
        reference: &ContentReference,
        commitment: CommitmentHash,
    ) -> Result<PendingTx, LedgerError> {
        let mut state = self.state.lock().await;
        Self::begin_submission(&mut state)?;

        let stored = Self::stored_commitment(&state, commitment);
        let tx_hash = Self::tx_hash(&state, reference.as_str());
        let fail_execution = state.fail_execution;
        let record = state.records.get_mut(&record_id).ok_or_else(|| {
            LedgerError::reverted(format!("execution reverted: nonexistent token {record_id}"))
        })?;
        if fail_execution {
            debug!(record_id = %record_id, tx_hash = %tx_hash, "Evolve reverted in memory");
            return Ok(Self::mine(&mut state, tx_hash, false, Vec::new()));
        }
        record.reference = reference.clone();
        record.commitment = stored;
        let block = state.block + 1;
        Self::remember(&mut state, record_id, block, stored);

        // ERC-4906 MetadataUpdate(uint256)
        let logs = vec![LogEntry {
            address: MEMORY_CONTRACT,
            topics: vec![keccak256("MetadataUpdate(uint256)")],
            data: Bytes::from(record_id.as_u256().to_be_bytes::<32>().to_vec()),
        }];

        debug!(record_id = %record_id, tx_hash = %tx_hash, "Evolved record in memory");
        Ok(Self::mine(&mut state, tx_hash, true, logs))
    }

    async fn read_uri(&self, record_id: RecordId) -> Result<ContentReference, LedgerError> {
        self.state
            .lock()
            .await
            .records
            .get(&record_id)
            .map(|r| r.reference.clone())
            .ok_or(LedgerError::NotFound(record_id))
    }

    async fn read_commitment(
        &self,
        record_id: RecordId,
        at_block: Option<u64>,
    ) -> Result<CommitmentHash, LedgerError> {
        let state = self.state.lock().await;
        match at_block {
            None => state.records.get(&record_id).map(|r| r.commitment),
            Some(block) => state.history.get(&record_id).and_then(|history| {
                history
                    .iter()
                    .rev()
                    .find(|(changed_in, _)| *changed_in <= block)
                    .map(|(_, commitment)| *commitment)
            }),
        }
        .ok_or(LedgerError::NotFound(record_id))
    }

    async fn await_confirmation(
        &self,
        pending: &PendingTx,
        _confirmations: u64,
    ) -> Result<Receipt, LedgerError> {
        let (withhold, delay) = {
            let state = self.state.lock().await;
            (state.withhold_receipts, state.confirmation_delay)
        };

        if withhold {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let receipt = self
            .state
            .lock()
            .await
            .receipts
            .get(&pending.tx_hash)
            .cloned()
            .ok_or_else(|| LedgerError::Transient(format!("unknown transaction {}", pending.tx_hash)))?;

        if !receipt.success {
            return Err(LedgerError::Reverted {
                reason: format!("reverted in block {}", receipt.block_number),
                tx_hash: Some(receipt.tx_hash),
            });
        }
        Ok(receipt)
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, LedgerError> {
        let state = self.state.lock().await;
        if state.withhold_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(&tx_hash).cloned())
    }
}
