/// Ethereum ledger client.
///
/// Talks to an evolvable ERC-721 contract over raw JSON-RPC:
/// - `mint(to, uri, uriHash)` creates a record and emits `Transfer`
/// - `evolve(tokenId, newUri, newHash)` repoints an existing record
/// - `tokenURI` / `metadataHash` read the current binding
///
/// Transactions are legacy transactions signed locally with the configured
/// key and broadcast with `eth_sendRawTransaction`. The account nonce is
/// cached between submissions and refetched after any failure.
use std::time::Duration;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::abi;
use super::{LedgerClient, LogEntry, PendingTx, Receipt};
use crate::anchor::{CommitmentHash, ContentReference, RecordId, TxHash};
use crate::error::{AnchorError, LedgerError};

/// Configuration for Ethereum access.
#[derive(Debug, Clone)]
pub struct EthereumConfig {
    /// Ethereum JSON-RPC endpoint (e.g., Infura, Alchemy, local node).
    pub rpc_url: String,
    /// Private key (hex) of the account that signs mint/evolve calls.
    pub private_key_hex: String,
    /// Chain ID (1 for mainnet, 11155111 for Sepolia).
    pub chain_id: u64,
    /// Address of the anchoring contract.
    pub contract_address: Address,
    /// How often to poll for receipts while waiting for confirmation.
    pub poll_interval: Duration,
}

/// Ethereum implementation of [`LedgerClient`].
pub struct EthereumLedger {
    config: EthereumConfig,
    client: Client,
    signer: PrivateKeySigner,
    /// Next nonce for the signer; `None` means fetch from the node.
    nonce: Mutex<Option<u64>>,
}

/// Simplified JSON-RPC response.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

/// Sends of one signed transaction before its fate is left to the
/// confirmation wait.
const BROADCAST_ATTEMPTS: u32 = 3;

/// A transaction ready to broadcast.
struct SignedCall {
    tx_hash: TxHash,
    nonce: u64,
    raw_hex: String,
}

/// What the node did with a signed transaction.
enum Broadcast {
    Accepted,
    /// The node answered the first send with an error; nothing is in flight.
    Rejected(RpcFailure),
    /// The transaction may or may not have reached the node.
    Uncertain(RpcFailure),
}

/// Why a JSON-RPC call failed, before deciding what it means.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RpcFailure {
    /// No usable response (connection, HTTP status, body parse).
    Transport(String),
    /// The node answered with a JSON-RPC error object.
    Rpc { code: i64, message: String },
}

impl RpcFailure {
    fn is_revert(&self) -> bool {
        match self {
            RpcFailure::Rpc { code, message } => {
                *code == 3 || message.to_lowercase().contains("revert")
            }
            RpcFailure::Transport(_) => false,
        }
    }

    fn is_already_known(&self) -> bool {
        matches!(self, RpcFailure::Rpc { message, .. }
            if message.to_lowercase().contains("already known"))
    }

    /// Failures while building or broadcasting a state-changing call.
    fn into_submission_error(self) -> LedgerError {
        const PERMANENT: [&str; 5] = [
            "insufficient funds",
            "intrinsic gas too low",
            "gas required exceeds",
            "exceeds block gas limit",
            "invalid sender",
        ];

        if self.is_revert() {
            return LedgerError::reverted(self.message());
        }
        match &self {
            RpcFailure::Rpc { message, .. }
                if PERMANENT
                    .iter()
                    .any(|p| message.to_lowercase().contains(p)) =>
            {
                LedgerError::reverted(self.message())
            }
            _ => LedgerError::Transient(self.message()),
        }
    }

    /// Failures of view calls against a specific record.
    fn into_read_error(self, record_id: RecordId) -> LedgerError {
        if self.is_revert() {
            LedgerError::NotFound(record_id)
        } else {
            LedgerError::Transient(self.message())
        }
    }

    fn into_transient(self) -> LedgerError {
        LedgerError::Transient(self.message())
    }

    fn message(&self) -> String {
        match self {
            RpcFailure::Transport(message) => message.clone(),
            RpcFailure::Rpc { code, message } => format!("RPC error {code}: {message}"),
        }
    }
}

fn parse_quantity(raw: &str) -> Result<u64, RpcFailure> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| RpcFailure::Transport(format!("Invalid quantity '{raw}': {e}")))
}

/// Whether `head` is at least `required - 1` blocks past `mined_in`.
fn has_confirmations(head: u64, mined_in: u64, required: u64) -> bool {
    head.saturating_add(1) >= mined_in.saturating_add(required)
}

fn parse_hex_bytes(raw: &str) -> Result<Vec<u8>, RpcFailure> {
    hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| RpcFailure::Transport(format!("Invalid hex data: {e}")))
}

impl RpcReceipt {
    /// `None` while the transaction is still pending.
    fn into_receipt(self) -> Result<Option<Receipt>, RpcFailure> {
        let Some(block) = self.block_number else {
            return Ok(None);
        };

        let malformed = |what: &str| RpcFailure::Transport(format!("Malformed receipt {what}"));

        let tx_hash: B256 = self
            .transaction_hash
            .parse()
            .map_err(|_| malformed("transaction hash"))?;

        let logs = self
            .logs
            .into_iter()
            .map(|log| {
                let address: Address = log.address.parse().map_err(|_| malformed("log address"))?;
                let topics = log
                    .topics
                    .iter()
                    .map(|t| t.parse::<B256>().map_err(|_| malformed("log topic")))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(LogEntry {
                    address,
                    topics,
                    data: Bytes::from(parse_hex_bytes(&log.data)?),
                })
            })
            .collect::<Result<Vec<_>, RpcFailure>>()?;

        Ok(Some(Receipt {
            tx_hash: TxHash::from(tx_hash),
            block_number: parse_quantity(&block)?,
            success: self.status.as_deref() == Some("0x1"),
            logs,
        }))
    }
}

impl EthereumLedger {
    pub fn new(config: EthereumConfig) -> Result<Self, AnchorError> {
        let signer: PrivateKeySigner = config
            .private_key_hex
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| AnchorError::Validation(format!("Invalid ETH private key: {e}")))?;
        let signer = signer.with_chain_id(Some(config.chain_id));

        info!(
            signer = %signer.address(),
            contract = %config.contract_address,
            chain_id = config.chain_id,
            "Ethereum ledger client ready"
        );

        Ok(Self {
            config,
            client: Client::new(),
            signer,
            nonce: Mutex::new(None),
        })
    }

    /// Address of the signing account.
    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    /// Send a JSON-RPC request to the Ethereum node.
    async fn rpc_call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcFailure> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp = self
            .client
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(format!("{method} request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RpcFailure::Transport(format!(
                "{method} returned HTTP {status}"
            )));
        }

        let resp: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("RPC response parse error: {e}")))?;

        if let Some(err) = resp.error {
            return Err(RpcFailure::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        serde_json::from_value(resp.result.unwrap_or(Value::Null))
            .map_err(|e| RpcFailure::Transport(format!("Unexpected {method} result: {e}")))
    }

    /// Execute a view call against the contract, at `block` or the latest
    /// block.
    async fn eth_call(&self, data: Vec<u8>, block: Option<u64>) -> Result<Vec<u8>, RpcFailure> {
        let block_tag = match block {
            Some(number) => format!("{number:#x}"),
            None => "latest".to_string(),
        };
        let result: String = self
            .rpc_call(
                "eth_call",
                serde_json::json!([
                    {
                        "to": format!("{:#x}", self.config.contract_address),
                        "data": format!("0x{}", hex::encode(data)),
                    },
                    block_tag
                ]),
            )
            .await?;
        parse_hex_bytes(&result)
    }

    async fn estimate_gas(&self, from: Address, data: &[u8]) -> Result<u64, RpcFailure> {
        let gas_hex: String = self
            .rpc_call(
                "eth_estimateGas",
                serde_json::json!([{
                    "from": format!("{from:#x}"),
                    "to": format!("{:#x}", self.config.contract_address),
                    "data": format!("0x{}", hex::encode(data)),
                }]),
            )
            .await?;
        parse_quantity(&gas_hex)
    }

    async fn block_number(&self) -> Result<u64, RpcFailure> {
        let head: String = self
            .rpc_call("eth_blockNumber", serde_json::json!([]))
            .await?;
        parse_quantity(&head)
    }

    async fn fetch_receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, RpcFailure> {
        let receipt: Option<RpcReceipt> = self
            .rpc_call(
                "eth_getTransactionReceipt",
                serde_json::json!([tx_hash.to_string()]),
            )
            .await?;
        match receipt {
            Some(receipt) => receipt.into_receipt(),
            None => Ok(None),
        }
    }

    /// Sign and broadcast a call to the contract.
    ///
    /// Holds the nonce lock for the whole build-sign-send sequence so two
    /// submissions can never share a nonce. Once signed, only those exact
    /// bytes are ever broadcast for this call.
    async fn submit(&self, input: Vec<u8>) -> Result<PendingTx, LedgerError> {
        let mut nonce_slot = self.nonce.lock().await;

        let signed = match self.sign_call(&mut nonce_slot, input).await {
            Ok(signed) => signed,
            Err(e) => {
                *nonce_slot = None;
                return Err(e);
            }
        };

        match self.broadcast(&signed).await {
            Broadcast::Accepted => *nonce_slot = Some(signed.nonce + 1),
            Broadcast::Rejected(failure) => {
                *nonce_slot = None;
                return Err(failure.into_submission_error());
            }
            Broadcast::Uncertain(failure) => {
                // The node may hold the transaction; let the next submission
                // ask for the pending nonce instead of guessing.
                *nonce_slot = None;
                warn!(
                    tx_hash = %signed.tx_hash,
                    nonce = signed.nonce,
                    error = %failure.message(),
                    "Broadcast outcome unknown, tracking transaction by hash"
                );
            }
        }

        Ok(PendingTx::new(signed.tx_hash))
    }

    async fn sign_call(
        &self,
        nonce_slot: &mut Option<u64>,
        input: Vec<u8>,
    ) -> Result<SignedCall, LedgerError> {
        let from = self.signer.address();

        // A reverting call fails here, before anything is broadcast.
        let gas_estimate = self
            .estimate_gas(from, &input)
            .await
            .map_err(RpcFailure::into_submission_error)?;

        let nonce = match *nonce_slot {
            Some(nonce) => nonce,
            None => {
                let nonce_hex: String = self
                    .rpc_call(
                        "eth_getTransactionCount",
                        serde_json::json!([format!("{from:#x}"), "pending"]),
                    )
                    .await
                    .map_err(RpcFailure::into_transient)?;
                parse_quantity(&nonce_hex).map_err(RpcFailure::into_transient)?
            }
        };

        let gas_price_hex: String = self
            .rpc_call("eth_gasPrice", serde_json::json!([]))
            .await
            .map_err(RpcFailure::into_transient)?;
        let gas_price = u128::from_str_radix(gas_price_hex.trim_start_matches("0x"), 16)
            .map_err(|e| LedgerError::Transient(format!("Invalid gas price: {e}")))?;

        let tx = TxLegacy {
            chain_id: Some(self.config.chain_id),
            nonce,
            gas_price,
            gas_limit: gas_estimate.saturating_mul(12) / 10,
            to: TxKind::Call(self.config.contract_address),
            value: U256::ZERO,
            input: Bytes::from(input),
        };

        let sig_hash = tx.signature_hash();
        let sig = self
            .signer
            .sign_hash(&sig_hash)
            .await
            .map_err(|e| LedgerError::reverted(format!("ETH signing failed: {e}")))?;

        let signed = tx.into_signed(sig);
        let tx_hash = TxHash::from(*signed.hash());
        let envelope = TxEnvelope::Legacy(signed);

        let mut raw_tx = Vec::new();
        envelope.encode_2718(&mut raw_tx);

        Ok(SignedCall {
            tx_hash,
            nonce,
            raw_hex: format!("0x{}", hex::encode(&raw_tx)),
        })
    }

    /// Send a signed transaction, resending the same bytes after transport
    /// failures.
    async fn broadcast(&self, signed: &SignedCall) -> Broadcast {
        let mut attempt = 1;

        loop {
            match self
                .rpc_call::<String>(
                    "eth_sendRawTransaction",
                    serde_json::json!([signed.raw_hex]),
                )
                .await
            {
                Ok(node_hash) => {
                    debug!(tx_hash = %signed.tx_hash, node_hash = %node_hash, nonce = signed.nonce, attempt, "Transaction broadcast");
                    return Broadcast::Accepted;
                }
                Err(failure) if failure.is_already_known() => {
                    debug!(tx_hash = %signed.tx_hash, nonce = signed.nonce, "Transaction already known to node");
                    return Broadcast::Accepted;
                }
                // An explicit refusal of bytes the node has never seen.
                Err(failure @ RpcFailure::Rpc { .. }) if attempt == 1 => {
                    return Broadcast::Rejected(failure);
                }
                Err(failure @ RpcFailure::Rpc { .. }) => return Broadcast::Uncertain(failure),
                Err(failure) if attempt >= BROADCAST_ATTEMPTS => {
                    return Broadcast::Uncertain(failure);
                }
                Err(failure) => {
                    warn!(
                        tx_hash = %signed.tx_hash,
                        attempt,
                        error = %failure.message(),
                        "Broadcast failed, resending the same transaction"
                    );
                }
            }

            attempt += 1;
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl LedgerClient for EthereumLedger {
    fn name(&self) -> &str {
        "Ethereum"
    }

    fn contract_address(&self) -> Address {
        self.config.contract_address
    }

    async fn submit_create(
        &self,
        owner: Address,
        reference: &ContentReference,
        commitment: CommitmentHash,
    ) -> Result<PendingTx, LedgerError> {
        let call = abi::mintCall {
            to: owner,
            uri: reference.to_string(),
            uriHash: commitment.as_b256(),
        };
        self.submit(call.abi_encode()).await
    }

    async fn submit_update(
        &self,
        record_id: RecordId,
        reference: &ContentReference,
        commitment: CommitmentHash,
    ) -> Result<PendingTx, LedgerError> {
        let call = abi::evolveCall {
            tokenId: record_id.as_u256(),
            newUri: reference.to_string(),
            newHash: commitment.as_b256(),
        };
        self.submit(call.abi_encode()).await
    }

    async fn read_uri(&self, record_id: RecordId) -> Result<ContentReference, LedgerError> {
        let call = abi::tokenURICall {
            tokenId: record_id.as_u256(),
        };
        let output = self
            .eth_call(call.abi_encode(), None)
            .await
            .map_err(|f| f.into_read_error(record_id))?;
        let decoded = abi::tokenURICall::abi_decode_returns(&output, true)
            .map_err(|e| LedgerError::Transient(format!("Undecodable tokenURI result: {e}")))?;

        ContentReference::from_ledger(decoded.uri).ok_or(LedgerError::NotFound(record_id))
    }

    async fn read_commitment(
        &self,
        record_id: RecordId,
        at_block: Option<u64>,
    ) -> Result<CommitmentHash, LedgerError> {
        let call = abi::metadataHashCall {
            tokenId: record_id.as_u256(),
        };
        let output = self
            .eth_call(call.abi_encode(), at_block)
            .await
            .map_err(|f| f.into_read_error(record_id))?;
        let decoded = abi::metadataHashCall::abi_decode_returns(&output, true)
            .map_err(|e| LedgerError::Transient(format!("Undecodable metadataHash result: {e}")))?;

        Ok(CommitmentHash::from(decoded.commitment))
    }

    async fn await_confirmation(
        &self,
        pending: &PendingTx,
        confirmations: u64,
    ) -> Result<Receipt, LedgerError> {
        let required = confirmations.max(1);

        loop {
            match self.fetch_receipt(pending.tx_hash).await {
                Ok(Some(receipt)) if !receipt.success => {
                    return Err(LedgerError::Reverted {
                        reason: format!("reverted in block {}", receipt.block_number),
                        tx_hash: Some(receipt.tx_hash),
                    });
                }
                Ok(Some(receipt)) => match self.block_number().await {
                    Ok(head) if has_confirmations(head, receipt.block_number, required) => {
                        return Ok(receipt);
                    }
                    Ok(head) => {
                        debug!(
                            tx_hash = %pending.tx_hash,
                            block = receipt.block_number,
                            head,
                            required,
                            "Waiting for confirmations"
                        );
                    }
                    Err(failure) => {
                        warn!(tx_hash = %pending.tx_hash, error = %failure.message(), "Block number poll failed");
                    }
                },
                Ok(None) => {}
                Err(failure) => {
                    warn!(tx_hash = %pending.tx_hash, error = %failure.message(), "Receipt poll failed");
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, LedgerError> {
        self.fetch_receipt(tx_hash)
            .await
            .map_err(RpcFailure::into_transient)
    }
}
