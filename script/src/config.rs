//! Environment-driven configuration and the table of supported chains.

use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::{address, Address};

use crate::error::{Result, WalletError};

pub const DEFAULT_CHAIN_ID: u64 = 5003;
pub const DEFAULT_PROVER_URL: &str = "http://localhost:3001";
pub const DEFAULT_SIGNATURE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainInfo {
    pub chain_id: u64,
    pub name: &'static str,
    pub rpc_url: &'static str,
    /// Zero while the pool is not deployed on this chain.
    pub pool_address: Address,
}

pub const SUPPORTED_CHAINS: &[ChainInfo] = &[
    ChainInfo {
        chain_id: 5003,
        name: "Mantle Sepolia",
        rpc_url: "https://rpc.sepolia.mantle.xyz",
        pool_address: address!("54EC23CBCE1A9d33F05C4d3d79Ec28Aff3c8ce8D"),
    },
    ChainInfo {
        chain_id: 5000,
        name: "Mantle",
        rpc_url: "https://rpc.mantle.xyz",
        pool_address: Address::ZERO,
    },
];

pub fn chain_info(chain_id: u64) -> Option<&'static ChainInfo> {
    SUPPORTED_CHAINS.iter().find(|c| c.chain_id == chain_id)
}

/// The pool contract for `chain_id`, honouring an explicit override.
pub fn resolve_pool_address(chain_id: u64, override_address: Option<Address>) -> Result<Address> {
    if let Some(address) = override_address {
        return Ok(address);
    }
    match chain_info(chain_id) {
        Some(info) if !info.pool_address.is_zero() => Ok(info.pool_address),
        _ => Err(WalletError::UnsupportedChain(chain_id)),
    }
}

#[derive(Clone)]
pub struct WalletConfig {
    pub rpc_url: String,
    pub private_key: Option<String>,
    pub chain_id: u64,
    pub pool_address: Option<Address>,
    pub prover_url: String,
    pub data_dir: PathBuf,
    pub keystore_passphrase: Option<String>,
    pub deploy_block: u64,
    pub signature_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl std::fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("pool_address", &self.pool_address)
            .field("prover_url", &self.prover_url)
            .field("data_dir", &self.data_dir)
            .field("deploy_block", &self.deploy_block)
            .finish_non_exhaustive()
    }
}

impl WalletConfig {
    /// Read configuration from the process environment. Call
    /// `dotenv::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let chain_id = parse_var(&var, "CHAIN_ID")?.unwrap_or(DEFAULT_CHAIN_ID);
        let rpc_url = match var("RPC_URL") {
            Some(url) => url,
            None => chain_info(chain_id)
                .map(|c| c.rpc_url.to_string())
                .ok_or_else(|| WalletError::Config("RPC_URL not set".into()))?,
        };
        let pool_address = var("POOL_ADDRESS")
            .map(|s| {
                s.parse::<Address>()
                    .map_err(|e| WalletError::Config(format!("POOL_ADDRESS: {e}")))
            })
            .transpose()?;

        Ok(WalletConfig {
            rpc_url,
            private_key: var("PRIVATE_KEY"),
            chain_id,
            pool_address,
            prover_url: var("PROVER_URL").unwrap_or_else(|| DEFAULT_PROVER_URL.to_string()),
            data_dir: var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| default_data_dir(var("HOME"))),
            keystore_passphrase: var("KEYSTORE_PASSPHRASE"),
            deploy_block: parse_var(&var, "DEPLOY_BLOCK")?.unwrap_or(0),
            signature_timeout: Duration::from_secs(
                parse_var(&var, "SIGNATURE_TIMEOUT_SECS")?.unwrap_or(DEFAULT_SIGNATURE_TIMEOUT_SECS),
            ),
            rpc_timeout: Duration::from_secs(
                parse_var(&var, "RPC_TIMEOUT_SECS")?.unwrap_or(DEFAULT_RPC_TIMEOUT_SECS),
            ),
        })
    }

    pub fn pool_address(&self) -> Result<Address> {
        resolve_pool_address(self.chain_id, self.pool_address)
    }
}

fn default_data_dir(home: Option<String>) -> PathBuf {
    match home {
        Some(home) => PathBuf::from(home).join(".shielded-wallet"),
        None => PathBuf::from(".shielded-wallet"),
    }
}

fn parse_var(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    var(key)
        .map(|s| {
            s.trim()
                .parse::<u64>()
                .map_err(|e| WalletError::Config(format!("{key} must be a number: {e}")))
        })
        .transpose()
}
