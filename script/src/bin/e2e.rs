//! End-to-end run: deposit → sync → root check → withdraw against a deployed pool.
//!
//! Exercises the full wallet lifecycle with real transactions:
//!   1. Initializes the wallet (derives keys from a signature, syncs)
//!   2. Approves and deposits a token amount as a new shielded note
//!   3. Syncs and checks the local Merkle root against the contract
//!   4. Withdraws to the wallet's public address (needs a reachable prover)
//!   5. Verifies the spent nullifiers and the withdrawal event on-chain
//!
//! Usage:
//!   cargo run --release -p shielded-wallet-script --bin e2e
//!
//! Required env vars (from .env):
//!   PRIVATE_KEY       Funded wallet private key
//!   TOKEN_ADDRESS     ERC20 token address
//!
//! Optional env vars:
//!   RPC_URL, CHAIN_ID, POOL_ADDRESS, PROVER_URL, DATA_DIR, DEPLOY_BLOCK
//!   DEPOSIT_AMOUNT    Deposit in base units (default: 1000000)
//!   WITHDRAW_AMOUNT   Withdraw in base units (default: DEPOSIT_AMOUNT)
//!   SKIP_WITHDRAW     Set to stop after the root check

use alloy::primitives::{Address, U256};
use anyhow::{ensure, Context, Result};
use shielded_wallet_script::{connect, setup_logger, Connected, PoolClient, WalletConfig};

fn env_amount(key: &str, default: U256) -> Result<U256> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<U256>().with_context(|| format!("{key} must be an integer")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    setup_logger();

    // ── Step 0: Load config ────────────────────────────────────────────
    println!("\n=== Shielded Wallet E2E ===\n");

    let config = WalletConfig::from_env()?;
    let token: Address = std::env::var("TOKEN_ADDRESS")
        .context("TOKEN_ADDRESS not set")?
        .parse()?;
    let deposit_amount = env_amount("DEPOSIT_AMOUNT", U256::from(1_000_000u64))?;
    let withdraw_amount = env_amount("WITHDRAW_AMOUNT", deposit_amount)?;
    let skip_withdraw = std::env::var("SKIP_WITHDRAW").is_ok();

    ensure!(deposit_amount > U256::ZERO, "DEPOSIT_AMOUNT must be positive");
    ensure!(
        withdraw_amount <= deposit_amount,
        "WITHDRAW_AMOUNT ({withdraw_amount}) > DEPOSIT_AMOUNT ({deposit_amount})"
    );

    println!("RPC:              {}", config.rpc_url);
    println!("Chain:            {}", config.chain_id);
    println!("Pool:             {}", config.pool_address()?);
    println!("Token:            {token}");
    println!("Deposit amount:   {deposit_amount}");
    println!("Withdraw amount:  {withdraw_amount}\n");

    // ── Step 1: Connect and initialize ─────────────────────────────────
    let Connected {
        wallet,
        contracts,
        prover,
        store_dir,
    } = connect(&config).await?;
    let account = wallet.address();
    println!("[1] Wallet: {account}");
    println!("    State dir: {}", store_dir.display());

    wallet.initialize().await?;
    let keys = wallet.public_keys().await?;
    println!("    View key:  0x{}", hex::encode(keys.view_public_key));
    println!("    Spend key: 0x{}", hex::encode(keys.spend_public_key));

    let balance_before = wallet.balance_by_token().await.get(&token).copied().unwrap_or_default();
    let public_before = contracts.token_balance(token, account).await?;
    println!("    Shielded balance: {balance_before}");
    println!("    Public balance:   {public_before}");
    ensure!(
        public_before >= deposit_amount,
        "wallet holds {public_before}, needs {deposit_amount} to deposit"
    );

    // ── Step 2: Deposit ────────────────────────────────────────────────
    println!("[2] Approving token spend...");
    match wallet.approve_if_needed(token, deposit_amount).await? {
        Some(tx) => println!("    Approve tx: {tx}"),
        None => println!("    Allowance already sufficient"),
    }

    println!("    Depositing {deposit_amount}...");
    let prepared = wallet.prepare_deposit(token, deposit_amount).await?;
    let deposit = wallet
        .execute_deposit(prepared.token, prepared.amount, &prepared.commitment)
        .await?;
    println!("    Deposit tx: {}", deposit.tx_hash);
    println!("    Leaf index: {}", deposit.note.leaf_index);

    let balance_after_deposit = wallet.balance_by_token().await.get(&token).copied().unwrap_or_default();
    ensure!(
        balance_after_deposit == balance_before + deposit_amount,
        "shielded balance {balance_after_deposit}, expected {}",
        balance_before + deposit_amount
    );

    // ── Step 3: Sync and compare roots ─────────────────────────────────
    println!("[3] Syncing with chain...");
    let report = wallet.sync_with_chain().await?;
    ensure!(
        report.transport_error.is_none(),
        "sync failed: {}",
        report.transport_error.unwrap_or_default()
    );
    println!("    New leaves:  {}", report.inserted_leaves);
    println!("    Synced to:   block {}", report.last_synced_block);

    let on_chain_leaves = contracts.next_leaf_index().await?;
    let snapshot = wallet.snapshot().await;
    println!("    Local leaves:    {}", snapshot.next_leaf_index);
    println!("    On-chain leaves: {on_chain_leaves}");

    let roots_match = wallet.verify_root_against_chain().await?;
    println!("    Root:  0x{}", hex::encode(snapshot.merkle_root));
    ensure!(roots_match, "local Merkle root does not match the pool");
    println!("    Root matches on-chain");

    let proof = wallet.generate_merkle_proof(deposit.note.leaf_index).await?;
    ensure!(proof.verify(&snapshot.merkle_root), "deposit proof does not verify");
    println!("    Deposit leaf proof verifies");

    // ── Step 4: Withdraw ───────────────────────────────────────────────
    if skip_withdraw {
        println!("[4] SKIP_WITHDRAW set, stopping here");
        println!("\n=== E2E complete (deposit only) ===\n");
        return Ok(());
    }
    if !prover.health().await {
        println!("[4] Prover at {} unreachable, skipping withdraw", prover.base_url());
        println!("\n=== E2E complete (deposit only) ===\n");
        return Ok(());
    }

    println!("[4] Withdrawing {withdraw_amount} to {account}...");
    let withdraw = wallet.execute_withdraw(token, withdraw_amount, account).await?;
    println!("    Withdraw tx:  {}", withdraw.tx_hash);
    println!("    Notes spent:  {}", withdraw.spent_nullifiers.len());

    // ── Step 5: Verify nullifiers ──────────────────────────────────────
    println!("[5] Checking nullifiers on-chain...");
    for nullifier in &withdraw.spent_nullifiers {
        let used = contracts.is_nullifier_used(*nullifier).await?;
        println!("    0x{}: {}", hex::encode(nullifier), if used { "spent" } else { "UNSPENT" });
        ensure!(used, "nullifier 0x{} not marked on-chain", hex::encode(nullifier));
    }

    let paid = wallet
        .withdrawal_history()
        .await?
        .into_iter()
        .any(|e| e.transaction_hash == Some(withdraw.tx_hash));
    ensure!(paid, "no WithdrawExecuted event for {}", withdraw.tx_hash);
    println!("    WithdrawExecuted event found");

    let public_after = contracts.token_balance(token, account).await?;
    println!("    Public balance: {public_before} -> {public_after}");

    let shielded_after = wallet.balance_by_token().await.get(&token).copied().unwrap_or_default();
    println!("    Shielded balance: {shielded_after}");
    ensure!(
        wallet.get_unspent_notes().await.iter().all(|n| !withdraw.spent_nullifiers.contains(&n.nullifier)),
        "withdrawn notes still unspent locally"
    );

    println!("\n=== E2E complete ===\n");
    Ok(())
}
