//! Deterministic view/spend key derivation from a wallet signature.
//!
//! The connected wallet signs [`KEY_DERIVATION_MESSAGE`] once. Both private
//! keys are domain-separated hash-to-scalar outputs of that signature, so the
//! same account signing the same message always recovers the same keys.

use std::fmt;

use alloy_primitives::Address;
use k256::Scalar;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::curve::{self, CompressedPoint};
use crate::encoding::{encode_hex, fixed_hex};
use crate::error::CryptoError;
use crate::keccak256_concat;

/// Message the wallet signs. Versioned: changing it changes every key.
pub const KEY_DERIVATION_MESSAGE: &str = "Shielded Wallet Key Derivation\n\n\
Sign this message to derive your private viewing and spending keys.\n\
This request will not trigger a blockchain transaction or cost any gas.\n\n\
Version: 1";

pub const VIEW_KEY_DOMAIN: &[u8] = b"SHIELDED_WALLET_VIEW_KEY_V1";
pub const SPEND_KEY_DOMAIN: &[u8] = b"SHIELDED_WALLET_SPEND_KEY_V1";

/// Shortest signature accepted as key material (r || s).
pub const MIN_SIGNATURE_LEN: usize = 64;

/// View and spend keypairs bound to one wallet address.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct WalletKeys {
    #[zeroize(skip)]
    pub address: Address,
    #[serde(with = "fixed_hex")]
    pub view_private_key: [u8; 32],
    #[zeroize(skip)]
    #[serde(with = "fixed_hex")]
    pub view_public_key: CompressedPoint,
    #[serde(with = "fixed_hex")]
    pub spend_private_key: [u8; 32],
    #[zeroize(skip)]
    #[serde(with = "fixed_hex")]
    pub spend_public_key: CompressedPoint,
}

impl fmt::Debug for WalletKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeys")
            .field("address", &self.address)
            .field("view_public_key", &encode_hex(&self.view_public_key))
            .field("spend_public_key", &encode_hex(&self.spend_public_key))
            .finish_non_exhaustive()
    }
}

impl PartialEq for WalletKeys {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.view_private_key == other.view_private_key
            && self.spend_private_key == other.spend_private_key
            && self.view_public_key == other.view_public_key
            && self.spend_public_key == other.spend_public_key
    }
}

impl Eq for WalletKeys {}

/// Public halves, safe to hand to senders.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeys {
    #[serde(with = "fixed_hex")]
    pub view_public_key: CompressedPoint,
    #[serde(with = "fixed_hex")]
    pub spend_public_key: CompressedPoint,
}

impl WalletKeys {
    /// Build keys from raw private scalars, recomputing the public halves.
    pub fn from_private_keys(
        address: Address,
        view_private_key: [u8; 32],
        spend_private_key: [u8; 32],
    ) -> Result<Self, CryptoError> {
        let view = curve::parse_secret_scalar(&view_private_key)?;
        let spend = curve::parse_secret_scalar(&spend_private_key)?;
        Ok(Self {
            address,
            view_private_key,
            view_public_key: curve::public_key_from_scalar(&view)?,
            spend_private_key,
            spend_public_key: curve::public_key_from_scalar(&spend)?,
        })
    }

    pub fn export_public_keys(&self) -> PublicKeys {
        PublicKeys {
            view_public_key: self.view_public_key,
            spend_public_key: self.spend_public_key,
        }
    }

    /// True when the public keys are the images of the private keys.
    pub fn is_consistent(&self) -> bool {
        Self::from_private_keys(self.address, self.view_private_key, self.spend_private_key)
            .map(|derived| derived == *self)
            .unwrap_or(false)
    }
}

/// keccak256(domain || material || counter) mod n, skipping zero.
pub fn hash_to_scalar(domain: &[u8], material: &[u8]) -> Scalar {
    let mut counter: u32 = 0;
    loop {
        let digest = keccak256_concat(&[domain, material, &counter.to_be_bytes()]);
        let scalar = curve::reduce_scalar(&digest);
        if !bool::from(scalar.is_zero()) {
            return scalar;
        }
        counter = counter.wrapping_add(1);
    }
}

/// Derive the wallet's view and spend keys from its signature over
/// [`KEY_DERIVATION_MESSAGE`].
pub fn derive_keys_from_signature(address: Address, signature: &[u8]) -> Result<WalletKeys, CryptoError> {
    if signature.len() < MIN_SIGNATURE_LEN {
        return Err(CryptoError::InvalidLength {
            expected: MIN_SIGNATURE_LEN,
            actual: signature.len(),
        });
    }

    let view = hash_to_scalar(VIEW_KEY_DOMAIN, signature);
    let spend = hash_to_scalar(SPEND_KEY_DOMAIN, signature);

    WalletKeys::from_private_keys(
        address,
        curve::scalar_to_bytes(&view),
        curve::scalar_to_bytes(&spend),
    )
}
