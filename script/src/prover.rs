//! HTTP client for the external prover service.
//!
//! A failed or refused proof is always an error. There is no fallback proof.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use shielded_wallet_lib::{ProofResponse, SwapProofRequest, TransactionProofRequest, WithdrawProofRequest};
use tracing::{debug, warn};

use crate::error::{Result, WalletError};

pub const TRANSACTION_PROOF_PATH: &str = "/api/prove/transaction";
pub const WITHDRAW_PROOF_PATH: &str = "/api/prove/withdraw";
pub const SWAP_PROOF_PATH: &str = "/api/prove/swap";
pub const HEALTH_PATH: &str = "/api/health";

/// Proof generation is slow; this bounds one request end to end.
pub const PROOF_TIMEOUT: Duration = Duration::from_secs(300);

/// Anything that turns witness data into an on-chain proof.
#[async_trait]
pub trait ProofService: Send + Sync {
    async fn request_transaction_proof(&self, request: &TransactionProofRequest) -> Result<ProofResponse>;
    async fn request_withdraw_proof(&self, request: &WithdrawProofRequest) -> Result<ProofResponse>;
    async fn request_swap_proof(&self, request: &SwapProofRequest) -> Result<ProofResponse>;
}

pub struct ProverClient {
    base_url: String,
    client: reqwest::Client,
}

impl ProverClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WalletError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(ProverClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True when the service answers its health check.
    pub async fn health(&self) -> bool {
        let url = format!("{}{}", self.base_url, HEALTH_PATH);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "prover health check failed");
                false
            }
        }
    }

    async fn prove<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<ProofResponse> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| WalletError::Prover(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(%status, path, "prover returned error status");
            return Err(WalletError::Prover(format!("HTTP {status}: {text}")));
        }

        let response: ProofResponse = resp
            .json()
            .await
            .map_err(|e| WalletError::Prover(format!("invalid response: {e}")))?;
        check_response(response)
    }
}

/// Reject responses that do not carry a usable proof.
pub fn check_response(response: ProofResponse) -> Result<ProofResponse> {
    if !response.success {
        let reason = response
            .error
            .unwrap_or_else(|| "prover reported failure".to_string());
        return Err(WalletError::Prover(reason));
    }
    if response.proof_bytes.is_empty() {
        return Err(WalletError::Prover("empty proof".to_string()));
    }
    Ok(response)
}

#[async_trait]
impl ProofService for ProverClient {
    async fn request_transaction_proof(&self, request: &TransactionProofRequest) -> Result<ProofResponse> {
        self.prove(TRANSACTION_PROOF_PATH, request).await
    }

    async fn request_withdraw_proof(&self, request: &WithdrawProofRequest) -> Result<ProofResponse> {
        self.prove(WITHDRAW_PROOF_PATH, request).await
    }

    async fn request_swap_proof(&self, request: &SwapProofRequest) -> Result<ProofResponse> {
        self.prove(SWAP_PROOF_PATH, request).await
    }
}
