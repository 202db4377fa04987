//! Request and response bodies exchanged with the prover service.
//!
//! The service proves; this crate only shapes the witness data. Amounts are
//! decimal strings and byte strings are 0x-hex, matching the JSON the
//! service accepts.

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::encoding::{decimal_u256, fixed_hex, hex_vec};
use crate::merkle::MerkleProof;
use crate::note::Note;

/// A note being consumed, with its inclusion path.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProofInputNote {
    #[serde(with = "fixed_hex")]
    pub commitment: [u8; 32],
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    #[serde(with = "fixed_hex")]
    pub blinding: [u8; 32],
    pub leaf_index: u64,
    #[serde(with = "hex_vec")]
    pub path_elements: Vec<[u8; 32]>,
    pub path_indices: Vec<u8>,
}

impl ProofInputNote {
    pub fn from_note(note: &Note, proof: MerkleProof) -> Self {
        ProofInputNote {
            commitment: note.commitment,
            amount: note.amount,
            blinding: note.blinding,
            leaf_index: note.leaf_index,
            path_elements: proof.path_elements,
            path_indices: proof.path_indices,
        }
    }
}

/// A note being created for `recipient_public_key`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProofOutputNote {
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    pub recipient_public_key: Bytes,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionProofRequest {
    pub input_notes: Vec<ProofInputNote>,
    pub output_notes: Vec<ProofOutputNote>,
    #[serde(with = "fixed_hex")]
    pub current_root: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawProofRequest {
    pub input_notes: Vec<ProofInputNote>,
    #[serde(with = "decimal_u256")]
    pub withdraw_amount: U256,
    pub receiver: Address,
    pub token: Address,
    #[serde(with = "fixed_hex")]
    pub current_root: [u8; 32],
}

/// One side of a dark-pool match: the notes it consumes and the notes it
/// creates, priced in two tokens.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SwapProofRequest {
    pub input_notes: Vec<ProofInputNote>,
    pub output_notes: Vec<ProofOutputNote>,
    pub token_in: Address,
    pub token_out: Address,
    #[serde(with = "decimal_u256")]
    pub amount_in: U256,
    #[serde(with = "decimal_u256")]
    pub min_amount_out: U256,
    #[serde(with = "fixed_hex")]
    pub current_root: [u8; 32],
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProofResponse {
    #[serde(default)]
    pub public_inputs: Bytes,
    #[serde(default)]
    pub proof_bytes: Bytes,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
