//! Typed adapter over the shielded account contract and ERC20 tokens.
//!
//! [`PoolClient`] is the seam the wallet talks through: one method per
//! logical contract operation, wire encoding hidden behind it.
//! [`ContractService`] implements it with alloy; tests substitute an
//! in-memory pool.

use std::future::IntoFuture;
use std::time::Duration;

use alloy::{
    network::ReceiptResponse,
    primitives::{Address, Bytes, FixedBytes, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::WalletConfig;
use crate::error::{Result, WalletError};

// ---------------------------------------------------------------------------
// Contract bindings (inline, no ABI files needed)
// ---------------------------------------------------------------------------

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
    }

    #[sol(rpc)]
    interface IShieldedAccount {
        function deposit(address token, uint256 amount, bytes32 commitment, bytes calldata encryptedMemo) external;
        function transact(bytes calldata publicInputs, bytes calldata proofBytes) external;
        function withdraw(bytes calldata publicInputs, bytes calldata proofBytes, address receiver) external;
        function executeSwap(bytes calldata publicInputs, bytes calldata proofBytes) external;
        function merkleRoot() external view returns (bytes32);
        function nullifierUsed(bytes32 nullifier) external view returns (bool);
        function zeroHashes(uint256 level) external view returns (bytes32);
        function nextLeafIndex() external view returns (uint32);

        event AccountUpdated(bytes32 commitment, bytes encryptedMemo);
        event TransactionExecuted(bytes32 newRoot, bytes32[] nullifiers, bytes32[] newCommitments);
        event WithdrawExecuted(address indexed receiver, address indexed token, uint256 amount);
        event SwapExecuted(bytes32 newRoot, bytes32 orderAKeyImage, bytes32 orderBKeyImage);
    }
}

// ---------------------------------------------------------------------------
// Event and receipt types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountUpdatedEvent {
    pub commitment: [u8; 32],
    pub encrypted_memo: Bytes,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Option<B256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionExecutedEvent {
    pub new_root: [u8; 32],
    pub nullifiers: Vec<[u8; 32]>,
    pub new_commitments: Vec<[u8; 32]>,
    pub block_number: u64,
    pub transaction_hash: Option<B256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawExecutedEvent {
    pub receiver: Address,
    pub token: Address,
    pub amount: U256,
    pub block_number: u64,
    pub transaction_hash: Option<B256>,
}

/// Outcome of a mined transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub success: bool,
    pub block_number: Option<u64>,
}

// ---------------------------------------------------------------------------
// Adapter interface
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PoolClient: Send + Sync {
    fn contract_address(&self) -> Address;

    async fn merkle_root(&self) -> Result<[u8; 32]>;
    async fn is_nullifier_used(&self, nullifier: [u8; 32]) -> Result<bool>;
    async fn zero_hash(&self, level: u64) -> Result<[u8; 32]>;
    async fn next_leaf_index(&self) -> Result<u64>;

    async fn token_allowance(&self, token: Address, owner: Address) -> Result<U256>;
    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256>;
    /// Approve the pool to pull `amount` of `token`.
    async fn approve_token(&self, token: Address, amount: U256) -> Result<B256>;

    async fn deposit(&self, token: Address, amount: U256, commitment: [u8; 32], encrypted_memo: Bytes) -> Result<B256>;
    async fn transact(&self, public_inputs: Bytes, proof_bytes: Bytes) -> Result<B256>;
    async fn withdraw(&self, public_inputs: Bytes, proof_bytes: Bytes, receiver: Address) -> Result<B256>;
    async fn execute_swap(&self, public_inputs: Bytes, proof_bytes: Bytes) -> Result<B256>;

    /// Block until the transaction is mined and report its status.
    async fn wait_for_transaction(&self, hash: B256) -> Result<TxReceipt>;

    /// Commitment appends from `from_block` onward, in chain order.
    async fn account_updated_events(&self, from_block: u64) -> Result<Vec<AccountUpdatedEvent>>;
    async fn transaction_executed_events(&self, from_block: u64) -> Result<Vec<TransactionExecutedEvent>>;
    async fn withdraw_executed_events(
        &self,
        receiver: Option<Address>,
        from_block: u64,
    ) -> Result<Vec<WithdrawExecutedEvent>>;

    async fn all_commitments(&self, from_block: u64) -> Result<Vec<[u8; 32]>> {
        Ok(self
            .account_updated_events(from_block)
            .await?
            .into_iter()
            .map(|e| e.commitment)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// alloy implementation
// ---------------------------------------------------------------------------

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ContractService {
    provider: DynProvider,
    pool_address: Address,
    sender: Address,
    rpc_timeout: Duration,
}

impl ContractService {
    pub fn new(provider: DynProvider, pool_address: Address, sender: Address, rpc_timeout: Duration) -> Self {
        ContractService {
            provider,
            pool_address,
            sender,
            rpc_timeout,
        }
    }

    /// Connect over HTTP with `signer` as the sending account.
    pub fn connect(config: &WalletConfig, signer: PrivateKeySigner) -> Result<Self> {
        let pool_address = config.pool_address()?;
        let url = config
            .rpc_url
            .parse::<alloy::transports::http::reqwest::Url>()
            .map_err(|e| WalletError::Config(format!("RPC_URL: {e}")))?;
        let sender = signer.address();
        let provider = ProviderBuilder::new().wallet(signer).connect_http(url).erased();
        info!(chain_id = config.chain_id, pool = %pool_address, %sender, "contract service ready");
        Ok(Self::new(provider, pool_address, sender, config.rpc_timeout))
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub async fn chain_id(&self) -> Result<u64> {
        self.rpc("eth_chainId", self.provider.get_chain_id()).await
    }

    pub async fn token_decimals(&self, token: Address) -> Result<u8> {
        let erc20 = IERC20::new(token, &self.provider);
        self.rpc("decimals", erc20.decimals().call()).await
    }

    pub async fn token_symbol(&self, token: Address) -> Result<String> {
        let erc20 = IERC20::new(token, &self.provider);
        self.rpc("symbol", erc20.symbol().call()).await
    }

    /// Run one RPC round-trip under the configured timeout.
    async fn rpc<F, T, E>(&self, what: &str, call: F) -> Result<T>
    where
        F: IntoFuture<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(WalletError::Transport(format!("{what}: {e}"))),
            Err(_) => Err(WalletError::Transport(format!(
                "{what}: timed out after {}s",
                self.rpc_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl PoolClient for ContractService {
    fn contract_address(&self) -> Address {
        self.pool_address
    }

    async fn merkle_root(&self) -> Result<[u8; 32]> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let root: FixedBytes<32> = self.rpc("merkleRoot", pool.merkleRoot().call()).await?;
        Ok(root.0)
    }

    async fn is_nullifier_used(&self, nullifier: [u8; 32]) -> Result<bool> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        self.rpc("nullifierUsed", pool.nullifierUsed(FixedBytes::from(nullifier)).call())
            .await
    }

    async fn zero_hash(&self, level: u64) -> Result<[u8; 32]> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let hash: FixedBytes<32> = self.rpc("zeroHashes", pool.zeroHashes(U256::from(level)).call()).await?;
        Ok(hash.0)
    }

    async fn next_leaf_index(&self) -> Result<u64> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let index: u32 = self.rpc("nextLeafIndex", pool.nextLeafIndex().call()).await?;
        Ok(u64::from(index))
    }

    async fn token_allowance(&self, token: Address, owner: Address) -> Result<U256> {
        let erc20 = IERC20::new(token, &self.provider);
        self.rpc("allowance", erc20.allowance(owner, self.pool_address).call())
            .await
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256> {
        let erc20 = IERC20::new(token, &self.provider);
        self.rpc("balanceOf", erc20.balanceOf(owner).call()).await
    }

    async fn approve_token(&self, token: Address, amount: U256) -> Result<B256> {
        let erc20 = IERC20::new(token, &self.provider);
        let pending = self
            .rpc("approve", erc20.approve(self.pool_address, amount).send())
            .await?;
        debug!(tx = %pending.tx_hash(), %token, %amount, "approve sent");
        Ok(*pending.tx_hash())
    }

    async fn deposit(&self, token: Address, amount: U256, commitment: [u8; 32], encrypted_memo: Bytes) -> Result<B256> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let pending = self
            .rpc(
                "deposit",
                pool.deposit(token, amount, FixedBytes::from(commitment), encrypted_memo)
                    .send(),
            )
            .await?;
        debug!(tx = %pending.tx_hash(), "deposit sent");
        Ok(*pending.tx_hash())
    }

    async fn transact(&self, public_inputs: Bytes, proof_bytes: Bytes) -> Result<B256> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let pending = self
            .rpc("transact", pool.transact(public_inputs, proof_bytes).send())
            .await?;
        Ok(*pending.tx_hash())
    }

    async fn withdraw(&self, public_inputs: Bytes, proof_bytes: Bytes, receiver: Address) -> Result<B256> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let pending = self
            .rpc("withdraw", pool.withdraw(public_inputs, proof_bytes, receiver).send())
            .await?;
        debug!(tx = %pending.tx_hash(), %receiver, "withdraw sent");
        Ok(*pending.tx_hash())
    }

    async fn execute_swap(&self, public_inputs: Bytes, proof_bytes: Bytes) -> Result<B256> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let pending = self
            .rpc("executeSwap", pool.executeSwap(public_inputs, proof_bytes).send())
            .await?;
        Ok(*pending.tx_hash())
    }

    async fn wait_for_transaction(&self, hash: B256) -> Result<TxReceipt> {
        let deadline = tokio::time::Instant::now() + RECEIPT_TIMEOUT;
        loop {
            let receipt = self
                .rpc("eth_getTransactionReceipt", self.provider.get_transaction_receipt(hash))
                .await?;
            if let Some(receipt) = receipt {
                let status = TxReceipt {
                    transaction_hash: hash,
                    success: receipt.status(),
                    block_number: receipt.block_number,
                };
                if !status.success {
                    warn!(tx = %hash, "transaction reverted");
                }
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WalletError::Transport(format!(
                    "transaction {hash} not mined after {}s",
                    RECEIPT_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn account_updated_events(&self, from_block: u64) -> Result<Vec<AccountUpdatedEvent>> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let logs = self
            .rpc("AccountUpdated logs", pool.AccountUpdated_filter().from_block(from_block).query())
            .await?;

        let mut events: Vec<_> = logs
            .into_iter()
            .map(|(event, log)| AccountUpdatedEvent {
                commitment: event.commitment.0,
                encrypted_memo: event.encryptedMemo,
                block_number: log.block_number.unwrap_or(0),
                log_index: log.log_index.unwrap_or(0),
                transaction_hash: log.transaction_hash,
            })
            .collect();
        // Leaves must be replayed in insertion order
        events.sort_by_key(|e| (e.block_number, e.log_index));
        debug!(from_block, count = events.len(), "fetched AccountUpdated events");
        Ok(events)
    }

    async fn transaction_executed_events(&self, from_block: u64) -> Result<Vec<TransactionExecutedEvent>> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let logs = self
            .rpc(
                "TransactionExecuted logs",
                pool.TransactionExecuted_filter().from_block(from_block).query(),
            )
            .await?;
        Ok(logs
            .into_iter()
            .map(|(event, log)| TransactionExecutedEvent {
                new_root: event.newRoot.0,
                nullifiers: event.nullifiers.iter().map(|n| n.0).collect(),
                new_commitments: event.newCommitments.iter().map(|c| c.0).collect(),
                block_number: log.block_number.unwrap_or(0),
                transaction_hash: log.transaction_hash,
            })
            .collect())
    }

    async fn withdraw_executed_events(
        &self,
        receiver: Option<Address>,
        from_block: u64,
    ) -> Result<Vec<WithdrawExecutedEvent>> {
        let pool = IShieldedAccount::new(self.pool_address, &self.provider);
        let mut filter = pool.WithdrawExecuted_filter().from_block(from_block);
        if let Some(receiver) = receiver {
            filter = filter.topic1(receiver.into_word());
        }
        let logs = self.rpc("WithdrawExecuted logs", filter.query()).await?;
        Ok(logs
            .into_iter()
            .map(|(event, log)| WithdrawExecutedEvent {
                receiver: event.receiver,
                token: event.token,
                amount: event.amount,
                block_number: log.block_number.unwrap_or(0),
                transaction_hash: log.transaction_hash,
            })
            .collect())
    }
}
