/// Record id recovery from transaction receipts.
///
/// The ledger picks the id of a newly minted record; the only place it is
/// reported is the `Transfer(address(0), owner, tokenId)` event in the
/// receipt. The relevant log may appear anywhere in the list, next to
/// events from other contracts or unrelated transfers.
use alloy::primitives::{Address, U256};
use alloy::sol_types::SolEvent;

use super::abi::Transfer;
use super::Receipt;
use crate::anchor::RecordId;
use crate::error::AnchorError;

/// Extracts ids assigned by the anchoring contract.
#[derive(Debug, Clone)]
pub struct ReceiptParser {
    contract: Address,
}

impl ReceiptParser {
    pub fn new(contract: Address) -> Self {
        Self { contract }
    }

    /// Find the id minted by this transaction.
    ///
    /// A mint is a `Transfer` emitted by the contract with four topics
    /// (signature, from, to, tokenId) and a zero `from`. Anything else is
    /// ignored. No match is a `Parse` error, even though the transaction
    /// itself succeeded.
    pub fn parse_created_id(&self, receipt: &Receipt) -> Result<RecordId, AnchorError> {
        receipt
            .logs
            .iter()
            .filter(|log| log.address == self.contract)
            .filter(|log| log.topics.len() == 4 && log.topics[0] == Transfer::SIGNATURE_HASH)
            .find(|log| log.topics[1].is_zero())
            .map(|log| RecordId::from(U256::from_be_slice(log.topics[3].as_slice())))
            .ok_or_else(|| AnchorError::Parse {
                tx_hash: receipt.tx_hash,
                reason: format!(
                    "no Transfer from the zero address emitted by {:#x} among {} log(s)",
                    self.contract,
                    receipt.logs.len()
                ),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::TxHash;
    use crate::ledger::LogEntry;
    use alloy::primitives::{Bytes, B256};

    fn transfer_log(contract: Address, from: Address, to: Address, id: u64) -> LogEntry {
        LogEntry {
            address: contract,
            topics: vec![
                Transfer::SIGNATURE_HASH,
                from.into_word(),
                to.into_word(),
                B256::from(U256::from(id).to_be_bytes::<32>()),
            ],
            data: Bytes::new(),
        }
    }

    fn receipt(logs: Vec<LogEntry>) -> Receipt {
        Receipt {
            tx_hash: TxHash::from([0x01; 32]),
            block_number: 10,
            success: true,
            logs,
        }
    }

    #[test]
    fn test_signature_hash() {
        assert_eq!(
            Transfer::SIGNATURE_HASH.to_string(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_finds_mint_among_other_logs() {
        let contract = Address::repeat_byte(0xcc);
        let owner = Address::repeat_byte(0x0a);
        let other = Address::repeat_byte(0x0b);

        let logs = vec![
            // Unrelated contract emitting a mint-shaped event.
            transfer_log(Address::repeat_byte(0xdd), Address::ZERO, owner, 99),
            // Ordinary transfer from the anchoring contract.
            transfer_log(contract, other, owner, 5),
            LogEntry {
                address: contract,
                topics: vec![B256::repeat_byte(0x42)],
                data: Bytes::from_static(b"evolved"),
            },
            transfer_log(contract, Address::ZERO, owner, 7),
        ];

        let parser = ReceiptParser::new(contract);
        assert_eq!(
            parser.parse_created_id(&receipt(logs)).unwrap(),
            RecordId::from(7u64)
        );
    }

    #[test]
    fn test_missing_event_is_parse_error() {
        let contract = Address::repeat_byte(0xcc);
        let parser = ReceiptParser::new(contract);

        let err = parser.parse_created_id(&receipt(vec![])).unwrap_err();
        assert!(matches!(err, AnchorError::Parse { .. }));
        assert_eq!(err.tx_hash(), Some(&TxHash::from([0x01; 32])));

        // ERC-20 style Transfer (tokenId in data, three topics) does not count.
        let erc20 = LogEntry {
            address: contract,
            topics: vec![
                Transfer::SIGNATURE_HASH,
                Address::ZERO.into_word(),
                Address::repeat_byte(1).into_word(),
            ],
            data: Bytes::from(U256::from(3u64).to_be_bytes::<32>().to_vec()),
        };
        assert!(parser.parse_created_id(&receipt(vec![erc20])).is_err());
    }
}
