//! Client-side cryptography for the shielded pool.
//!
//! Everything in this crate is pure and synchronous: key derivation from a
//! wallet signature, Pedersen commitments, stealth addresses, the incremental
//! Merkle tree mirrored from the pool contract, nullifiers and notes. The
//! host crate wires these to the chain, the prover service and storage.

use tiny_keccak::{Hasher, Keccak};

pub mod commitment;
pub mod curve;
pub mod encoding;
pub mod error;
pub mod inputs;
pub mod keys;
pub mod merkle;
pub mod note;
pub mod stealth;

pub use alloy_primitives::{Address, U256};
pub use commitment::{
    create_balanced_commitments, create_commitment, h_generator, recompute_commitment,
    verify_balance, verify_balance_with_amounts, verify_commitment, BalancedCommitments,
    Commitment, Opening,
};
pub use curve::{CompressedPoint, UncompressedPoint};
pub use error::CryptoError;
pub use inputs::{
    ProofInputNote, ProofOutputNote, ProofResponse, SwapProofRequest, TransactionProofRequest,
    WithdrawProofRequest,
};
pub use keys::{derive_keys_from_signature, PublicKeys, WalletKeys, KEY_DERIVATION_MESSAGE};
pub use merkle::{compute_zeros, verify_proof, MerkleProof, MerkleTree, TreeSnapshot, MAX_TREE_DEPTH, TREE_DEPTH};
pub use note::{compute_nullifier, Note};
pub use stealth::{
    check_ownership, compute_stealth_private_key, generate_stealth_address, StealthAddress,
};

// =============================================================================
//                          KECCAK256 HELPERS
// =============================================================================

/// Compute keccak256 hash. This matches Solidity's keccak256() opcode.
/// Note: tiny_keccak::Keccak is the original Keccak-256 (NOT SHA3-256).
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Keccak256 over several slices without concatenating them first.
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    for part in parts {
        hasher.update(part);
    }
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Hash a pair of 32-byte nodes. Matches Solidity:
///   keccak256(abi.encodePacked(left, right))
pub fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    keccak256_concat(&[left, right])
}
