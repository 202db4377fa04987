use alloy::primitives::{B256, U256};
use shielded_wallet_lib::CryptoError;
use thiserror::Error;

pub type Result<T, E = WalletError> = std::result::Result<T, E>;

/// Substrings wallets use when the user declines a signature prompt. Bare
/// "rejected" also shows up in node and rate-limit errors, so it is not one.
const REJECTION_MARKERS: [&str; 8] = [
    "user rejected",
    "user denied",
    "user cancelled",
    "user canceled",
    "rejected by user",
    "denied by user",
    "cancelled by user",
    "canceled by user",
];

#[derive(Debug, Error)]
pub enum WalletError {
    /// The signature request was declined or never answered.
    #[error("signature request rejected: {0}")]
    UserRejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("persisted state is corrupt: {0}")]
    StorageCorrupt(String),
    #[error("storage I/O failed: {0}")]
    Storage(String),
    #[error("wallet is not initialized")]
    NotInitialized,
    #[error("deposit failed: {0}")]
    DepositFailed(String),
    #[error("transaction {hash} reverted")]
    TransactionReverted { hash: B256 },
    #[error("prover service: {0}")]
    Prover(String),
    #[error("unsupported chain id {0}")]
    UnsupportedChain(u64),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("merkle root mismatch: local {local}, on-chain {on_chain}")]
    RootMismatch { local: B256, on_chain: B256 },
    #[error("insufficient shielded funds: have {available}, need {needed}")]
    InsufficientFunds { available: U256, needed: U256 },
}

impl WalletError {
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, WalletError::UserRejected(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, WalletError::Transport(_))
    }

    /// What to tell the user. Rejections get an actionable retry hint; every
    /// other failure is presented as-is.
    pub fn user_message(&self) -> String {
        match self {
            WalletError::UserRejected(_) => {
                "Signature request was rejected. Approve the signature to derive your shielded keys, then retry.".to_string()
            }
            WalletError::Transport(_) => format!("{self}. Check the RPC endpoint and retry."),
            other => other.to_string(),
        }
    }
}

/// Classify a signer failure by its message.
pub fn classify_signer_error(message: &str) -> WalletError {
    let lower = message.to_lowercase();
    if REJECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        WalletError::UserRejected(message.to_string())
    } else {
        WalletError::Transport(message.to_string())
    }
}
