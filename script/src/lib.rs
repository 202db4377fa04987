//! Host side of the shielded wallet: chain adapter, prover client,
//! persistence and the [`PrivacyWallet`] orchestrator.

use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod config;
pub mod contract;
pub mod error;
pub mod keystore;
pub mod prover;
pub mod selection;
pub mod signer;
pub mod storage;
pub mod wallet;

pub use config::WalletConfig;
pub use contract::{ContractService, PoolClient, TxReceipt};
pub use error::{Result, WalletError};
pub use prover::{ProofService, ProverClient, PROOF_TIMEOUT};
pub use selection::{LargestFirst, NoteSelector, SelectedNotes};
pub use signer::WalletSigner;
pub use storage::{FileStore, MemoryStore, StateStore};
pub use wallet::{PrivacyWallet, SpendOutcome, SwapOrder, SyncReport, WalletOptions, WalletSnapshot};

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
/// Safe to call more than once.
pub fn setup_logger() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Everything a binary needs, wired from configuration.
pub struct Connected {
    pub wallet: PrivacyWallet,
    pub contracts: Arc<ContractService>,
    pub prover: Arc<ProverClient>,
    pub store_dir: std::path::PathBuf,
}

/// Build a wallet for the configured private key: alloy contract service,
/// per-account file store and prover client. Fails if the RPC endpoint
/// reports a different chain than configured.
pub async fn connect(config: &WalletConfig) -> Result<Connected> {
    let private_key = config
        .private_key
        .as_deref()
        .ok_or_else(|| WalletError::Config("PRIVATE_KEY not set".into()))?;
    let signer: PrivateKeySigner = private_key
        .parse()
        .map_err(|e| WalletError::Config(format!("PRIVATE_KEY: {e}")))?;

    let contracts = Arc::new(ContractService::connect(config, signer.clone())?);
    let remote_chain = contracts.chain_id().await?;
    if remote_chain != config.chain_id {
        return Err(WalletError::Config(format!(
            "RPC endpoint is on chain {remote_chain}, expected {}",
            config.chain_id
        )));
    }

    let store = FileStore::for_account(&config.data_dir, config.chain_id, signer.address());
    let store_dir = store.dir().to_path_buf();
    let prover = Arc::new(ProverClient::new(&config.prover_url, PROOF_TIMEOUT)?);
    info!(dir = %store_dir.display(), prover = prover.base_url(), "wallet storage ready");

    let wallet = PrivacyWallet::new(
        Arc::new(signer),
        contracts.clone(),
        Arc::new(store),
        WalletOptions::from(config),
    )?
    .with_prover(prover.clone());

    Ok(Connected {
        wallet,
        contracts,
        prover,
        store_dir,
    })
}
