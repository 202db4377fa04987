//! Shielded wallet CLI.
//!
//! Subcommands:
//!   init             - Derive (or unlock) wallet keys and sync with the pool
//!   address          - Print the account and its shielded public keys
//!   balance          - Shielded balance per token
//!   notes            - Dump notes as JSON
//!   deposit          - Approve and deposit tokens into the pool
//!   sync             - Pull new commitments and spent nullifiers
//!   withdraw         - Prove and withdraw to a public address
//!   receive-address  - Generate a one-time stealth address
//!   withdrawals      - List withdrawals paid to this account
//!   rebuild-tree     - Rebuild the local tree from every on-chain commitment
//!   reset            - Delete local wallet state for this account
//!
//! Configuration comes from the environment (and `.env`); flags override it.

use std::path::PathBuf;

use alloy::primitives::{
    utils::{format_units, parse_units},
    Address, U256,
};
use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use shielded_wallet_script::{config::chain_info, connect, setup_logger, Connected, WalletConfig, WalletError};

#[derive(Parser)]
#[command(name = "shielded-wallet")]
#[command(about = "Private notes on the shielded pool: deposit, sync, withdraw")]
struct Cli {
    /// RPC endpoint (overrides RPC_URL)
    #[arg(long, global = true)]
    rpc_url: Option<String>,
    /// Chain id (overrides CHAIN_ID)
    #[arg(long, global = true)]
    chain_id: Option<u64>,
    /// Pool contract (overrides POOL_ADDRESS and the chain table)
    #[arg(long, global = true)]
    pool: Option<Address>,
    /// Prover service base URL (overrides PROVER_URL)
    #[arg(long, global = true)]
    prover_url: Option<String>,
    /// Wallet state directory (overrides DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive or unlock keys and sync with the pool
    Init,
    /// Print the account address and shielded public keys
    Address,
    /// Shielded balance per token
    Balance,
    /// Print notes as JSON
    Notes {
        /// Only notes of this token
        #[arg(long)]
        token: Option<Address>,
        /// Include spent notes
        #[arg(long, default_value = "false")]
        all: bool,
    },
    /// Deposit tokens into the pool as a new note
    Deposit {
        #[arg(long)]
        token: Address,
        /// Amount in base units, or in whole tokens with --units
        #[arg(long)]
        amount: String,
        /// Token decimals used to scale --amount
        #[arg(long)]
        units: Option<u8>,
    },
    /// Sync commitments and nullifiers from the chain
    Sync,
    /// Withdraw from the pool to a public address
    Withdraw {
        #[arg(long)]
        token: Address,
        #[arg(long)]
        amount: String,
        #[arg(long)]
        units: Option<u8>,
        #[arg(long)]
        receiver: Address,
    },
    /// Generate a one-time stealth address paying this wallet
    ReceiveAddress,
    /// List withdrawals paid to this account
    Withdrawals,
    /// Rebuild the local tree from the chain and re-place misplaced notes
    RebuildTree,
    /// Delete local notes, tree and sealed keys for this account
    Reset {
        /// Confirm deletion
        #[arg(long, default_value = "false")]
        yes: bool,
    },
}

impl Cli {
    fn config(&self) -> Result<WalletConfig> {
        let mut config = WalletConfig::from_env()?;
        if let Some(chain_id) = self.chain_id {
            config.chain_id = chain_id;
            if std::env::var("RPC_URL").is_err() {
                if let Some(info) = chain_info(chain_id) {
                    config.rpc_url = info.rpc_url.to_string();
                }
            }
        }
        if let Some(url) = &self.rpc_url {
            config.rpc_url = url.clone();
        }
        if self.pool.is_some() {
            config.pool_address = self.pool;
        }
        if let Some(url) = &self.prover_url {
            config.prover_url = url.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        Ok(config)
    }
}

fn parse_amount(raw: &str, units: Option<u8>) -> Result<U256> {
    match units {
        Some(decimals) => parse_units(raw, decimals)
            .map(|parsed| parsed.get_absolute())
            .map_err(|e| anyhow!("invalid amount {raw}: {e}")),
        None => raw.parse::<U256>().map_err(|e| anyhow!("invalid amount {raw}: {e}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    setup_logger();

    let cli = Cli::parse();
    let config = cli.config()?;

    if let Err(e) = run(cli.command, &config).await {
        if let Some(wallet_error) = e.downcast_ref::<WalletError>() {
            if wallet_error.is_user_rejection() {
                eprintln!("{}", wallet_error.user_message());
                std::process::exit(2);
            }
        }
        return Err(e);
    }
    Ok(())
}

async fn run(command: Commands, config: &WalletConfig) -> Result<()> {
    let Connected {
        wallet,
        contracts,
        prover,
        store_dir,
    } = connect(config).await.context("failed to connect")?;

    if !matches!(command, Commands::Reset { .. }) {
        wallet.initialize().await?;
    }

    match command {
        Commands::Init => {
            let snapshot = wallet.snapshot().await;
            println!("Account:      {}", snapshot.address);
            println!("Notes:        {}", snapshot.notes.len());
            println!("Leaves:       {}", snapshot.next_leaf_index);
            println!("Merkle root:  0x{}", hex::encode(snapshot.merkle_root));
            println!("State dir:    {}", store_dir.display());
        }
        Commands::Address => {
            let keys = wallet.public_keys().await?;
            println!("Account:          {}", wallet.address());
            println!("View public key:  0x{}", hex::encode(keys.view_public_key));
            println!("Spend public key: 0x{}", hex::encode(keys.spend_public_key));
        }
        Commands::Balance => {
            let balances = wallet.balance_by_token().await;
            if balances.is_empty() {
                println!("No shielded funds");
            }
            for (token, amount) in balances {
                let label = match (contracts.token_symbol(token).await, contracts.token_decimals(token).await) {
                    (Ok(symbol), Ok(decimals)) => match format_units(amount, decimals) {
                        Ok(formatted) => format!("{formatted} {symbol}"),
                        Err(_) => amount.to_string(),
                    },
                    _ => amount.to_string(),
                };
                println!("{token}  {label}");
            }
        }
        Commands::Notes { token, all } => {
            let notes: Vec<_> = wallet
                .all_notes()
                .await
                .into_iter()
                .filter(|n| all || n.is_unspent())
                .filter(|n| token.map_or(true, |t| n.token == t))
                .collect();
            println!("{}", serde_json::to_string_pretty(&notes)?);
        }
        Commands::Deposit { token, amount, units } => {
            let amount = parse_amount(&amount, units)?;
            ensure!(amount > U256::ZERO, "deposit amount must be positive");

            if let Some(tx) = wallet.approve_if_needed(token, amount).await? {
                println!("Approve tx:   {tx}");
            }
            let prepared = wallet.prepare_deposit(token, amount).await?;
            let outcome = wallet
                .execute_deposit(prepared.token, prepared.amount, &prepared.commitment)
                .await?;
            println!("Deposit tx:   {}", outcome.tx_hash);
            println!("Leaf index:   {}", outcome.note.leaf_index);
            println!("Commitment:   0x{}", hex::encode(outcome.note.commitment));
        }
        Commands::Sync => {
            let report = wallet.sync_with_chain().await?;
            if let Some(error) = &report.transport_error {
                bail!("sync incomplete: {error}");
            }
            println!("New leaves:   {}", report.inserted_leaves);
            println!("Newly spent:  {}", report.newly_spent);
            println!("Synced to:    block {}", report.last_synced_block);
            let matches = wallet.verify_root_against_chain().await?;
            println!("Root matches: {matches}");
        }
        Commands::Withdraw {
            token,
            amount,
            units,
            receiver,
        } => {
            let amount = parse_amount(&amount, units)?;
            ensure!(amount > U256::ZERO, "withdraw amount must be positive");
            ensure!(prover.health().await, "prover at {} is not reachable", prover.base_url());

            let outcome = wallet.execute_withdraw(token, amount, receiver).await?;
            println!("Withdraw tx:  {}", outcome.tx_hash);
            println!("Notes spent:  {}", outcome.spent_nullifiers.len());
            println!("Input total:  {}", outcome.selected_total);
        }
        Commands::ReceiveAddress => {
            let stealth = wallet.generate_receive_address().await?;
            println!("Address:        {}", stealth.address);
            println!("Ephemeral key:  0x{}", hex::encode(stealth.ephemeral_public_key));
            println!("View tag:       {}", stealth.view_tag);
        }
        Commands::Withdrawals => {
            let history = wallet.withdrawal_history().await?;
            if history.is_empty() {
                println!("No withdrawals to {}", wallet.address());
            }
            for event in history {
                let tx = event.transaction_hash.map(|h| h.to_string()).unwrap_or_default();
                println!("block {:>10}  {}  {}  {tx}", event.block_number, event.token, event.amount);
            }
        }
        Commands::RebuildTree => {
            let moved = wallet.rebuild_tree_from_chain().await?;
            let snapshot = wallet.snapshot().await;
            println!("Leaves:       {}", snapshot.next_leaf_index);
            println!("Notes moved:  {moved}");
            println!("Merkle root:  0x{}", hex::encode(snapshot.merkle_root));
        }
        Commands::Reset { yes } => {
            ensure!(yes, "refusing to delete {} without --yes", store_dir.display());
            wallet.clear_storage().await?;
            println!("Cleared {}", store_dir.display());
        }
    }
    Ok(())
}
