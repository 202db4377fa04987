//! Pedersen commitments over secp256k1.
//!
//!   C = r*G + amount*H
//!
//! H is derived once from a fixed domain string and G's compressed encoding:
//!   H = (keccak256("PEDERSEN_H_GENERATOR_V2" || G) mod n) * G
//! Every commitment already in the pool was built against this H, so the
//! derivation must never change.

use std::sync::OnceLock;

use alloy_primitives::U256;
use k256::{elliptic_curve::Group, ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};

use crate::curve::{self, CompressedPoint};
use crate::encoding::{decimal_u256, fixed_hex};
use crate::error::CryptoError;
use crate::keccak256;

const H_GENERATOR_DOMAIN: &[u8] = b"PEDERSEN_H_GENERATOR_V2";

static H_GENERATOR: OnceLock<ProjectivePoint> = OnceLock::new();

/// The second generator H. Computed on first use, then shared.
pub fn h_generator() -> ProjectivePoint {
    *H_GENERATOR.get_or_init(|| {
        let g = ProjectivePoint::GENERATOR;
        // G is never the identity, its encoding is always 33 bytes
        let g_bytes = curve::encode_compressed(&g).unwrap_or([0u8; 33]);
        let mut preimage = Vec::with_capacity(H_GENERATOR_DOMAIN.len() + g_bytes.len());
        preimage.extend_from_slice(H_GENERATOR_DOMAIN);
        preimage.extend_from_slice(&g_bytes);
        g * curve::reduce_scalar(&keccak256(&preimage))
    })
}

/// A commitment together with its opening.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Commitment {
    /// Compressed point r*G + amount*H
    #[serde(with = "fixed_hex")]
    pub commitment: CompressedPoint,
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    /// Blinding factor r, big-endian, below n
    #[serde(with = "fixed_hex")]
    pub blinding: [u8; 32],
}

impl Commitment {
    /// The 32-byte value accumulated on-chain for this commitment:
    /// keccak256 of the compressed point.
    pub fn leaf(&self) -> [u8; 32] {
        commitment_leaf(&self.commitment)
    }
}

/// An (amount, blinding) opening without the point, as used for balance checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Opening {
    pub amount: U256,
    pub blinding: [u8; 32],
}

#[derive(Clone, Debug)]
pub struct BalancedCommitments {
    pub inputs: Vec<Commitment>,
    pub outputs: Vec<Commitment>,
}

/// The bytes32 leaf for a compressed commitment point.
pub fn commitment_leaf(point: &CompressedPoint) -> [u8; 32] {
    keccak256(point)
}

fn amount_scalar(amount: U256) -> Result<Scalar, CryptoError> {
    curve::parse_scalar(&amount.to_be_bytes::<32>()).map_err(|_| CryptoError::AmountOutOfRange)
}

fn commit(amount: U256, blinding: &Scalar) -> Result<ProjectivePoint, CryptoError> {
    Ok(ProjectivePoint::GENERATOR * blinding + h_generator() * amount_scalar(amount)?)
}

/// Commit to `amount` under a fresh random blinding factor.
pub fn create_commitment(amount: U256) -> Result<Commitment, CryptoError> {
    let blinding = curve::random_secret_scalar();
    let point = commit(amount, &blinding)?;
    Ok(Commitment {
        commitment: curve::encode_compressed(&point)?,
        amount,
        blinding: curve::scalar_to_bytes(&blinding),
    })
}

/// Recompute the compressed commitment point for an opening.
pub fn recompute_commitment(amount: U256, blinding: &[u8; 32]) -> Result<CompressedPoint, CryptoError> {
    let blinding = curve::parse_scalar(blinding)?;
    curve::encode_compressed(&commit(amount, &blinding)?)
}

/// True iff `commitment` opens to `(amount, blinding)`. Malformed openings
/// simply fail to verify.
pub fn verify_commitment(commitment: &[u8], amount: U256, blinding: &[u8; 32]) -> bool {
    match recompute_commitment(amount, blinding) {
        Ok(recomputed) => recomputed.as_slice() == commitment,
        Err(_) => false,
    }
}

fn sum_points<T: AsRef<[u8]>>(points: &[T]) -> Result<ProjectivePoint, CryptoError> {
    points.iter().try_fold(ProjectivePoint::IDENTITY, |acc, bytes| {
        Ok(acc + curve::parse_point(bytes.as_ref())?)
    })
}

/// Homomorphic balance: sum(inputs) == sum(outputs) as curve points, with
/// the point at infinity as the empty sum. Undecodable points yield false.
pub fn verify_balance<T: AsRef<[u8]>>(inputs: &[T], outputs: &[T]) -> bool {
    match (sum_points(inputs), sum_points(outputs)) {
        (Ok(lhs), Ok(rhs)) => lhs == rhs,
        _ => false,
    }
}

fn checked_sum<'a>(amounts: impl IntoIterator<Item = &'a U256>) -> Option<U256> {
    amounts
        .into_iter()
        .try_fold(U256::ZERO, |acc, amount| acc.checked_add(*amount))
}

/// Balance check from openings. Plain amounts must balance first (and must
/// not overflow); only then are the points recomputed and compared.
pub fn verify_balance_with_amounts(inputs: &[Opening], outputs: &[Opening]) -> bool {
    let input_sum = checked_sum(inputs.iter().map(|o| &o.amount));
    let output_sum = checked_sum(outputs.iter().map(|o| &o.amount));
    match (input_sum, output_sum) {
        (Some(a), Some(b)) if a == b => {}
        _ => return false,
    }

    let recompute = |openings: &[Opening]| -> Option<Vec<CompressedPoint>> {
        openings
            .iter()
            .map(|o| recompute_commitment(o.amount, &o.blinding).ok())
            .collect()
    };
    match (recompute(inputs), recompute(outputs)) {
        (Some(ins), Some(outs)) => verify_balance(&ins, &outs),
        _ => false,
    }
}

/// Build one synthetic input commitment and one commitment per output such
/// that the set balances by construction: the input blinding is the sum of
/// the output blindings mod n.
pub fn create_balanced_commitments(
    input_amount: U256,
    output_amounts: &[U256],
) -> Result<BalancedCommitments, CryptoError> {
    let total = checked_sum(output_amounts);
    if total != Some(input_amount) {
        return Err(CryptoError::AmountMismatch {
            input: input_amount.to_string(),
            outputs: total.map_or_else(|| "overflow".to_string(), |t| t.to_string()),
        });
    }

    let mut outputs = Vec::with_capacity(output_amounts.len());
    let mut blinding_sum = Scalar::ZERO;
    for amount in output_amounts {
        let blinding = curve::random_secret_scalar();
        blinding_sum += blinding;
        outputs.push(Commitment {
            commitment: curve::encode_compressed(&commit(*amount, &blinding)?)?,
            amount: *amount,
            blinding: curve::scalar_to_bytes(&blinding),
        });
    }

    let input_point = commit(input_amount, &blinding_sum)?;
    if bool::from(input_point.is_identity()) {
        return Err(CryptoError::InvalidPoint);
    }
    let inputs = vec![Commitment {
        commitment: curve::encode_compressed(&input_point)?,
        amount: input_amount,
        blinding: curve::scalar_to_bytes(&blinding_sum),
    }];

    Ok(BalancedCommitments { inputs, outputs })
}
