/// Commitment hashing for content references.
///
/// The ledger stores `keccak256(bytes(uri))` next to every token URI, so
/// the commitment is computed over the UTF-8 bytes of the reference string
/// itself, not over the content it points to. Two processes given the same
/// reference always agree on the commitment.
///
/// BLAKE3 is used separately for content digests (e.g., deterministic
/// identifiers in the in-memory store).
use alloy::primitives::keccak256;

use crate::anchor::{CommitmentHash, ContentReference};

/// Compute the commitment hash bound to a reference string.
pub fn bind(reference: &str) -> CommitmentHash {
    CommitmentHash::from(keccak256(reference.as_bytes()))
}

/// Compute the commitment for a validated content reference.
pub fn bind_reference(reference: &ContentReference) -> CommitmentHash {
    bind(reference.as_str())
}

/// BLAKE3 digest of raw content bytes.
pub fn content_digest(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}
