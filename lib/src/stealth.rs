//! One-time stealth addresses (dual-key ECDH).
//!
//! Sender:    S = e*V                       (e ephemeral, V recipient view key)
//!            P = (keccak256(S) mod n)*G + B (B recipient spend key)
//!            address = keccak256(P_x || P_y)[12..]
//! Recipient: S = v*E, same P, and spends with p = keccak256(S) + b mod n.
//! The view tag is keccak256(S)[0], which lets a scanner reject most
//! foreign outputs after one ECDH and a single hash.

use alloy_primitives::Address;
use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};

use crate::curve::{self, CompressedPoint, UncompressedPoint};
use crate::encoding::fixed_hex;
use crate::error::CryptoError;
use crate::keccak256;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StealthAddress {
    pub address: Address,
    #[serde(with = "fixed_hex")]
    pub ephemeral_public_key: CompressedPoint,
    pub view_tag: u8,
}

fn secret_hash(shared_secret: &CompressedPoint) -> [u8; 32] {
    keccak256(shared_secret)
}

fn secret_scalar(shared_secret: &CompressedPoint) -> Result<Scalar, CryptoError> {
    let scalar = curve::reduce_scalar(&secret_hash(shared_secret));
    if bool::from(scalar.is_zero()) {
        return Err(CryptoError::ZeroScalar);
    }
    Ok(scalar)
}

fn view_tag(shared_secret: &CompressedPoint) -> u8 {
    secret_hash(shared_secret)[0]
}

fn stealth_point(shared_secret: &CompressedPoint, spend_public: &ProjectivePoint) -> Result<ProjectivePoint, CryptoError> {
    Ok(ProjectivePoint::GENERATOR * secret_scalar(shared_secret)? + spend_public)
}

/// Ethereum address of an uncompressed public key.
pub fn public_key_to_address(public_key: &UncompressedPoint) -> Address {
    let hash = keccak256(&public_key[1..]);
    Address::from_slice(&hash[12..])
}

/// Sender side, with an explicit ephemeral key. Returns the published
/// stealth address and the one-time public key it hashes.
pub fn generate_stealth_address_with_ephemeral(
    ephemeral_private_key: &[u8; 32],
    view_public_key: &[u8],
    spend_public_key: &[u8],
) -> Result<(StealthAddress, UncompressedPoint), CryptoError> {
    let ephemeral = curve::parse_secret_scalar(ephemeral_private_key)?;
    let view_public = curve::parse_point(view_public_key)?;
    let spend_public = curve::parse_point(spend_public_key)?;

    let shared = curve::shared_secret(&ephemeral, &view_public)?;
    let stealth_public = curve::encode_uncompressed(&stealth_point(&shared, &spend_public)?)?;

    let stealth = StealthAddress {
        address: public_key_to_address(&stealth_public),
        ephemeral_public_key: curve::public_key_from_scalar(&ephemeral)?,
        view_tag: view_tag(&shared),
    };
    Ok((stealth, stealth_public))
}

/// Sender side: a fresh one-time address for the recipient's public keys.
pub fn generate_stealth_address(
    view_public_key: &[u8],
    spend_public_key: &[u8],
) -> Result<StealthAddress, CryptoError> {
    let ephemeral = curve::scalar_to_bytes(&curve::random_secret_scalar());
    generate_stealth_address_with_ephemeral(&ephemeral, view_public_key, spend_public_key)
        .map(|(stealth, _)| stealth)
}

/// Recipient side: the one-time public key for an announced ephemeral key.
pub fn recover_stealth_public_key(
    ephemeral_public_key: &[u8],
    view_private_key: &[u8; 32],
    spend_public_key: &[u8],
) -> Result<UncompressedPoint, CryptoError> {
    let view = curve::parse_secret_scalar(view_private_key)?;
    let ephemeral_public = curve::parse_point(ephemeral_public_key)?;
    let spend_public = curve::parse_point(spend_public_key)?;
    let shared = curve::shared_secret(&view, &ephemeral_public)?;
    curve::encode_uncompressed(&stealth_point(&shared, &spend_public)?)
}

/// Does `stealth` belong to the holder of (view_private_key, spend_public_key)?
/// Malformed keys or points are "not mine", never an error.
pub fn check_ownership(stealth: &StealthAddress, view_private_key: &[u8; 32], spend_public_key: &[u8]) -> bool {
    let owned = || -> Result<bool, CryptoError> {
        let view = curve::parse_secret_scalar(view_private_key)?;
        let ephemeral_public = curve::parse_point(&stealth.ephemeral_public_key)?;
        let shared = curve::shared_secret(&view, &ephemeral_public)?;
        if view_tag(&shared) != stealth.view_tag {
            return Ok(false);
        }
        let spend_public = curve::parse_point(spend_public_key)?;
        let expected = curve::encode_uncompressed(&stealth_point(&shared, &spend_public)?)?;
        Ok(public_key_to_address(&expected) == stealth.address)
    };
    owned().unwrap_or(false)
}

/// The private key controlling a stealth address: keccak256(v*E) + b mod n.
pub fn compute_stealth_private_key(
    ephemeral_public_key: &[u8],
    view_private_key: &[u8; 32],
    spend_private_key: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let view = curve::parse_secret_scalar(view_private_key)?;
    let spend = curve::parse_secret_scalar(spend_private_key)?;
    let ephemeral_public = curve::parse_point(ephemeral_public_key)?;
    let shared = curve::shared_secret(&view, &ephemeral_public)?;
    let stealth = secret_scalar(&shared)? + spend;
    Ok(curve::scalar_to_bytes(&stealth))
}
