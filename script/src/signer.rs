//! The external wallet boundary: whoever can sign the key-derivation message.

use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::{local::PrivateKeySigner, Signer};
use async_trait::async_trait;
use shielded_wallet_lib::{derive_keys_from_signature, WalletKeys, KEY_DERIVATION_MESSAGE};
use tracing::{debug, info};

use crate::error::{classify_signer_error, Result, WalletError};

#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn account(&self) -> Address;

    /// Personal-sign `message`; returns the 65-byte r || s || v signature.
    async fn request_signature(&self, message: &[u8]) -> Result<Vec<u8>>;
}

#[async_trait]
impl WalletSigner for PrivateKeySigner {
    fn account(&self) -> Address {
        Signer::address(self)
    }

    async fn request_signature(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature = Signer::sign_message(self, message)
            .await
            .map_err(|e| classify_signer_error(&e.to_string()))?;
        Ok(signature.as_bytes().to_vec())
    }
}

/// Ask the signer for the key-derivation signature and derive view/spend
/// keys from it. A prompt left unanswered past `timeout` counts as declined.
pub async fn derive_wallet_keys(signer: &dyn WalletSigner, timeout: Duration) -> Result<WalletKeys> {
    let account = signer.account();
    debug!(%account, "requesting key derivation signature");

    let signature = tokio::time::timeout(timeout, signer.request_signature(KEY_DERIVATION_MESSAGE.as_bytes()))
        .await
        .map_err(|_| WalletError::UserRejected(format!("no signature after {}s", timeout.as_secs())))??;

    let keys = derive_keys_from_signature(account, &signature)?;
    info!(%account, "derived shielded keys");
    Ok(keys)
}
