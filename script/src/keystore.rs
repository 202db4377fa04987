//! Encryption at rest for wallet keys.
//!
//! AES-256-GCM under a key stretched from the passphrase with Argon2id.
//! Plaintext key material never reaches storage.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use shielded_wallet_lib::{Address, WalletKeys};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Result, WalletError};

pub const KEYSTORE_VERSION: u8 = 1;

/// Argon2 cost parameters, stored alongside the ciphertext.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // 64 MiB, 3 passes, 4 lanes
        KdfParams {
            m_cost: 65536,
            t_cost: 3,
            p_cost: 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedKeys {
    pub version: u8,
    /// Account the keys belong to, readable without the passphrase.
    pub address: Address,
    pub kdf: KdfParams,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

fn derive_cipher(passphrase: &str, salt: &[u8], params: KdfParams) -> Result<Aes256Gcm> {
    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(params.m_cost, params.t_cost, params.p_cost, Some(32))
            .map_err(|e| WalletError::Config(format!("argon2 params: {e}")))?,
    );

    let mut key_bytes = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key_bytes)
        .map_err(|e| WalletError::Storage(format!("key derivation failed: {e}")))?;
    let cipher = Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|e| WalletError::Storage(format!("cipher creation failed: {e}")));
    key_bytes.zeroize();
    cipher
}

impl SealedKeys {
    pub fn seal(keys: &WalletKeys, passphrase: &str) -> Result<Self> {
        Self::seal_with_params(keys, passphrase, KdfParams::default())
    }

    pub fn seal_with_params(keys: &WalletKeys, passphrase: &str, kdf: KdfParams) -> Result<Self> {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = derive_cipher(passphrase, &salt, kdf)?;
        let plaintext = Zeroizing::new(
            serde_json::to_vec(keys).map_err(|e| WalletError::Storage(e.to_string()))?,
        );
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| WalletError::Storage(format!("encryption failed: {e}")))?;

        Ok(SealedKeys {
            version: KEYSTORE_VERSION,
            address: keys.address,
            kdf,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt. A wrong passphrase and a tampered file are indistinguishable
    /// and both surface as `StorageCorrupt`.
    pub fn open(&self, passphrase: &str) -> Result<WalletKeys> {
        if self.version != KEYSTORE_VERSION {
            return Err(WalletError::StorageCorrupt(format!(
                "unknown keystore version {}",
                self.version
            )));
        }
        let corrupt = |what: &str| WalletError::StorageCorrupt(format!("keystore {what}"));

        let salt = hex::decode(&self.salt).map_err(|_| corrupt("salt"))?;
        let nonce_bytes = hex::decode(&self.nonce).map_err(|_| corrupt("nonce"))?;
        if nonce_bytes.len() != 12 {
            return Err(corrupt("nonce length"));
        }
        let ciphertext = hex::decode(&self.ciphertext).map_err(|_| corrupt("ciphertext"))?;

        let cipher = derive_cipher(passphrase, &salt, self.kdf)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
                .map_err(|_| corrupt("decryption failed (wrong passphrase or corrupted data)"))?,
        );
        let keys: WalletKeys = serde_json::from_slice(&plaintext).map_err(|_| corrupt("payload"))?;

        if keys.address != self.address || !keys.is_consistent() {
            return Err(corrupt("contents"));
        }
        Ok(keys)
    }
}
