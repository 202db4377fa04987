use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::commitment::{commitment_leaf, Commitment};
use crate::curve::CompressedPoint;
use crate::encoding::{decimal_u256, decimal_u64, fixed_hex};
use crate::keccak256_concat;

/// nullifier = keccak256(spendPrivateKey || uint256(leafIndex) || leaf)
///
/// Deterministic per (owner, position, commitment), so a note can only ever
/// produce one nullifier and the pool rejects its second spend.
pub fn compute_nullifier(spend_private_key: &[u8; 32], leaf_index: u64, leaf: &[u8; 32]) -> [u8; 32] {
    let index = U256::from(leaf_index).to_be_bytes::<32>();
    keccak256_concat(&[spend_private_key, &index, leaf])
}

/// A shielded UTXO held by this wallet.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Leaf value accumulated on-chain.
    #[serde(with = "fixed_hex")]
    pub commitment: [u8; 32],
    /// Pedersen point the leaf hashes.
    #[serde(with = "fixed_hex")]
    pub commitment_point: CompressedPoint,
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    #[serde(with = "fixed_hex")]
    pub blinding: [u8; 32],
    pub token: Address,
    pub leaf_index: u64,
    #[serde(with = "fixed_hex")]
    pub nullifier: [u8; 32],
    pub spent: bool,
    #[serde(with = "decimal_u64")]
    pub block_number: u64,
}

impl Note {
    /// Build an unspent note for a commitment placed at `leaf_index`.
    pub fn new(
        commitment: &Commitment,
        token: Address,
        leaf_index: u64,
        spend_private_key: &[u8; 32],
        block_number: u64,
    ) -> Self {
        let leaf = commitment_leaf(&commitment.commitment);
        Note {
            commitment: leaf,
            commitment_point: commitment.commitment,
            amount: commitment.amount,
            blinding: commitment.blinding,
            token,
            leaf_index,
            nullifier: compute_nullifier(spend_private_key, leaf_index, &leaf),
            spent: false,
            block_number,
        }
    }

    pub fn is_unspent(&self) -> bool {
        !self.spent
    }
}
