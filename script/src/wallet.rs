//! The privacy wallet: owns the keys, notes and the local tree mirror for
//! one account, and drives deposits, spends and chain sync.
//!
//! Mutating operations (`initialize`, `execute_deposit`, the spends,
//! `sync_with_chain`, `mark_notes_spent`, `rebuild_tree_from_chain`,
//! `clear_storage`) are serialized by `op_lock`. State sits behind an
//! `RwLock` that is only ever write-locked for short, await-free sections,
//! so readers see either the state before a step or after it. Network
//! calls happen with no state lock held.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::Serialize;
use shielded_wallet_lib::{
    commitment, compute_nullifier, encoding::fixed_hex, stealth, Commitment, CryptoError, MerkleProof, MerkleTree,
    Note, ProofInputNote, ProofOutputNote, PublicKeys, StealthAddress, SwapProofRequest, TransactionProofRequest,
    WalletKeys, WithdrawProofRequest, TREE_DEPTH,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::{WalletConfig, DEFAULT_SIGNATURE_TIMEOUT_SECS};
use crate::contract::{PoolClient, TxReceipt, WithdrawExecutedEvent};
use crate::error::{Result, WalletError};
use crate::keystore::{KdfParams, SealedKeys};
use crate::prover::ProofService;
use crate::selection::{LargestFirst, NoteSelector, SelectedNotes};
use crate::signer::{derive_wallet_keys, WalletSigner};
use crate::storage::{self, StateStore};

#[derive(Clone)]
pub struct WalletOptions {
    /// Seal derived keys under this passphrase. Without one, keys are
    /// re-derived from a fresh signature every session.
    pub keystore_passphrase: Option<String>,
    pub keystore_kdf: KdfParams,
    pub signature_timeout: Duration,
    /// Event scans never start below this block.
    pub deploy_block: u64,
    pub tree_levels: usize,
}

impl Default for WalletOptions {
    fn default() -> Self {
        WalletOptions {
            keystore_passphrase: None,
            keystore_kdf: KdfParams::default(),
            signature_timeout: Duration::from_secs(DEFAULT_SIGNATURE_TIMEOUT_SECS),
            deploy_block: 0,
            tree_levels: TREE_DEPTH,
        }
    }
}

impl From<&WalletConfig> for WalletOptions {
    fn from(config: &WalletConfig) -> Self {
        WalletOptions {
            keystore_passphrase: config.keystore_passphrase.clone(),
            keystore_kdf: KdfParams::default(),
            signature_timeout: config.signature_timeout,
            deploy_block: config.deploy_block,
            tree_levels: TREE_DEPTH,
        }
    }
}

struct WalletState {
    keys: Option<WalletKeys>,
    notes: Vec<Note>,
    tree: MerkleTree,
    last_synced_block: u64,
    is_initialized: bool,
}

impl WalletState {
    fn empty(tree_levels: usize) -> Self {
        WalletState {
            keys: None,
            notes: Vec::new(),
            tree: MerkleTree::new(tree_levels),
            last_synced_block: 0,
            is_initialized: false,
        }
    }

    fn keys(&self) -> Result<&WalletKeys> {
        match (&self.keys, self.is_initialized) {
            (Some(keys), true) => Ok(keys),
            _ => Err(WalletError::NotInitialized),
        }
    }

    fn unspent(&self) -> impl Iterator<Item = &Note> {
        self.notes.iter().filter(|n| n.is_unspent())
    }

    /// Pick unspent `token` notes covering `amount` and attach their
    /// inclusion paths against the current root.
    fn select_inputs(
        &self,
        selector: &dyn NoteSelector,
        token: Address,
        amount: U256,
    ) -> Result<(Vec<ProofInputNote>, SelectedNotes)> {
        self.keys()?;
        let candidates: Vec<Note> = self.unspent().filter(|n| n.token == token).cloned().collect();
        let selected = selector.select(&candidates, amount);
        if !selected.covers(amount) {
            return Err(WalletError::InsufficientFunds {
                available: selected.total,
                needed: amount,
            });
        }
        let input_notes = selected
            .notes
            .iter()
            .map(|note| Ok(ProofInputNote::from_note(note, self.tree.generate_proof(note.leaf_index)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok((input_notes, selected))
    }

    /// Flip matching unspent notes to spent; unknown nullifiers are ignored.
    fn apply_spent(&mut self, nullifiers: &[[u8; 32]]) -> usize {
        let mut count = 0;
        for nullifier in nullifiers {
            if let Some(note) = self
                .notes
                .iter_mut()
                .find(|n| n.is_unspent() && n.nullifier == *nullifier)
            {
                note.spent = true;
                count += 1;
            }
        }
        count
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Fresh wallet with nothing to verify; no chain queries were made.
    pub skipped: bool,
    pub inserted_leaves: usize,
    pub newly_spent: usize,
    pub last_synced_block: u64,
    /// Set when a chain query failed and the sync stopped early.
    pub transport_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PreparedDeposit {
    pub commitment: Commitment,
    pub token: Address,
    pub amount: U256,
}

#[derive(Clone, Debug)]
pub struct DepositOutcome {
    pub tx_hash: B256,
    pub note: Note,
}

#[derive(Clone, Debug)]
pub struct WithdrawOutcome {
    pub tx_hash: B256,
    pub spent_nullifiers: Vec<[u8; 32]>,
    pub selected_total: U256,
}

/// Result of a private transfer or swap.
#[derive(Clone, Debug)]
pub struct SpendOutcome {
    pub tx_hash: B256,
    pub spent_nullifiers: Vec<[u8; 32]>,
    pub selected_total: U256,
    /// Returned to this wallet's spend key. Zero when the inputs were exact.
    pub change: U256,
    /// Leaves the pool appended for the transaction, when it reported them.
    pub new_commitments: Vec<[u8; 32]>,
}

/// One side of a dark-pool match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapOrder {
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub min_amount_out: U256,
}

/// Read-only view of the wallet, safe to print or serialize.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub address: Address,
    pub is_initialized: bool,
    pub public_keys: Option<PublicKeys>,
    pub notes: Vec<Note>,
    #[serde(with = "fixed_hex")]
    pub merkle_root: [u8; 32],
    pub next_leaf_index: u64,
    pub last_synced_block: u64,
}

pub struct PrivacyWallet {
    signer: Arc<dyn WalletSigner>,
    pool: Arc<dyn PoolClient>,
    store: Arc<dyn StateStore>,
    prover: Option<Arc<dyn ProofService>>,
    selector: Box<dyn NoteSelector>,
    options: WalletOptions,
    state: RwLock<WalletState>,
    op_lock: Mutex<()>,
}

impl PrivacyWallet {
    pub fn new(
        signer: Arc<dyn WalletSigner>,
        pool: Arc<dyn PoolClient>,
        store: Arc<dyn StateStore>,
        options: WalletOptions,
    ) -> Result<Self> {
        // Validated once here; every later tree is built at this depth
        MerkleTree::try_new(options.tree_levels)?;
        let state = WalletState::empty(options.tree_levels);
        Ok(PrivacyWallet {
            signer,
            pool,
            store,
            prover: None,
            selector: Box::new(LargestFirst),
            options,
            state: RwLock::new(state),
            op_lock: Mutex::new(()),
        })
    }

    pub fn with_prover(mut self, prover: Arc<dyn ProofService>) -> Self {
        self.prover = Some(prover);
        self
    }

    pub fn with_selector(mut self, selector: impl NoteSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    // ==========================================================================
    // Lifecycle
    // ==========================================================================

    /// Load or derive keys, restore persisted notes and tree, then sync.
    ///
    /// Storage problems never fail initialization; a declined or timed-out
    /// signature does, with [`WalletError::UserRejected`].
    pub async fn initialize(&self) -> Result<()> {
        {
            let _op = self.op_lock.lock().await;
            if self.state.read().await.is_initialized {
                return Ok(());
            }

            let account = self.signer.account();
            let persisted = storage::load_state(self.store.as_ref()).await;

            let keys = match self.unseal(persisted.sealed_keys, account).await {
                Some(keys) => {
                    debug!(%account, "restored sealed keys");
                    keys
                }
                None => {
                    let keys = derive_wallet_keys(self.signer.as_ref(), self.options.signature_timeout).await?;
                    self.seal(&keys).await;
                    keys
                }
            };

            let levels = self.options.tree_levels;
            let (tree, last_synced_block) = match persisted.tree {
                Some(tree) if tree.levels() == levels => (tree, persisted.last_synced_block),
                // Without a usable tree, replay every commitment from the deploy block
                Some(_) | None => (MerkleTree::new(levels), 0),
            };

            let mut state = self.state.write().await;
            *state = WalletState {
                keys: Some(keys),
                notes: persisted.notes,
                tree,
                last_synced_block,
                is_initialized: true,
            };
            info!(
                %account,
                notes = state.notes.len(),
                leaves = state.tree.next_leaf_index(),
                last_synced_block,
                "wallet initialized"
            );
        }

        if let Err(e) = self.sync_with_chain().await {
            warn!(error = %e, "initial sync failed");
        }
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.is_initialized
    }

    async fn unseal(&self, sealed: Option<SealedKeys>, account: Address) -> Option<WalletKeys> {
        let sealed = sealed?;
        if sealed.address != account {
            debug!(stored = %sealed.address, %account, "sealed keys belong to another account");
            return None;
        }
        let Some(passphrase) = self.options.keystore_passphrase.clone().map(Zeroizing::new) else {
            debug!("sealed keys present but no passphrase configured");
            return None;
        };
        match tokio::task::spawn_blocking(move || sealed.open(&passphrase)).await {
            Ok(Ok(keys)) => Some(keys),
            Ok(Err(e)) => {
                warn!(error = %e, "could not open sealed keys, deriving again");
                None
            }
            Err(e) => {
                warn!(error = %e, "keystore task failed");
                None
            }
        }
    }

    async fn seal(&self, keys: &WalletKeys) {
        let Some(passphrase) = self.options.keystore_passphrase.clone().map(Zeroizing::new) else {
            return;
        };
        let keys = keys.clone();
        let kdf = self.options.keystore_kdf;
        let sealed = match tokio::task::spawn_blocking(move || SealedKeys::seal_with_params(&keys, &passphrase, kdf)).await {
            Ok(Ok(sealed)) => sealed,
            Ok(Err(e)) => {
                warn!(error = %e, "could not seal keys");
                return;
            }
            Err(e) => {
                warn!(error = %e, "keystore task failed");
                return;
            }
        };
        if let Err(e) = storage::save_sealed_keys(self.store.as_ref(), &sealed).await {
            warn!(error = %e, "could not persist sealed keys");
        }
    }

    /// Write notes, tree and sync height. Failures are logged: the in-memory
    /// state is authoritative and the next mutation writes it again.
    async fn persist(&self) {
        let (notes, tree, last_synced_block) = {
            let state = self.state.read().await;
            (state.notes.clone(), state.tree.serialize(), state.last_synced_block)
        };
        if let Err(e) = storage::save_state(self.store.as_ref(), &notes, &tree, last_synced_block).await {
            error!(error = %e, "failed to persist wallet state");
        }
    }

    /// Wipe persisted state and return to the uninitialized state.
    pub async fn clear_storage(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        storage::clear(self.store.as_ref()).await?;
        *self.state.write().await = WalletState::empty(self.options.tree_levels);
        info!(account = %self.signer.account(), "wallet storage cleared");
        Ok(())
    }

    // ==========================================================================
    // Keys and balances
    // ==========================================================================

    pub fn address(&self) -> Address {
        self.signer.account()
    }

    pub async fn public_keys(&self) -> Result<PublicKeys> {
        Ok(self.state.read().await.keys()?.export_public_keys())
    }

    /// Sum of all unspent notes, across tokens.
    pub async fn get_shielded_balance(&self) -> U256 {
        self.state
            .read()
            .await
            .unspent()
            .fold(U256::ZERO, |acc, n| acc.saturating_add(n.amount))
    }

    pub async fn balance_by_token(&self) -> BTreeMap<Address, U256> {
        let state = self.state.read().await;
        let mut balances = BTreeMap::new();
        for note in state.unspent() {
            let entry = balances.entry(note.token).or_insert(U256::ZERO);
            *entry = entry.saturating_add(note.amount);
        }
        balances
    }

    pub async fn get_unspent_notes(&self) -> Vec<Note> {
        self.state.read().await.unspent().cloned().collect()
    }

    pub async fn all_notes(&self) -> Vec<Note> {
        self.state.read().await.notes.clone()
    }

    /// Unspent notes of one token.
    pub async fn notes_for_token(&self, token: Address) -> Vec<Note> {
        self.state
            .read()
            .await
            .unspent()
            .filter(|n| n.token == token)
            .cloned()
            .collect()
    }

    pub async fn select_notes_for_amount(&self, token: Address, target: U256) -> SelectedNotes {
        let candidates = self.notes_for_token(token).await;
        self.selector.select(&candidates, target)
    }

    pub async fn snapshot(&self) -> WalletSnapshot {
        let state = self.state.read().await;
        WalletSnapshot {
            address: self.signer.account(),
            is_initialized: state.is_initialized,
            public_keys: state.keys().ok().map(WalletKeys::export_public_keys),
            notes: state.notes.clone(),
            merkle_root: state.tree.root(),
            next_leaf_index: state.tree.next_leaf_index(),
            last_synced_block: state.last_synced_block,
        }
    }

    // ==========================================================================
    // Stealth addresses and commitments
    // ==========================================================================

    /// A fresh one-time address paying this wallet.
    pub async fn generate_receive_address(&self) -> Result<StealthAddress> {
        let state = self.state.read().await;
        let keys = state.keys()?;
        Ok(stealth::generate_stealth_address(&keys.view_public_key, &keys.spend_public_key)?)
    }

    pub async fn check_stealth_ownership(&self, stealth_address: &StealthAddress) -> bool {
        let state = self.state.read().await;
        match state.keys() {
            Ok(keys) => stealth::check_ownership(stealth_address, &keys.view_private_key, &keys.spend_public_key),
            Err(_) => false,
        }
    }

    pub async fn compute_stealth_private_key(&self, ephemeral_public_key: &[u8]) -> Result<[u8; 32]> {
        let state = self.state.read().await;
        let keys = state.keys()?;
        Ok(stealth::compute_stealth_private_key(
            ephemeral_public_key,
            &keys.view_private_key,
            &keys.spend_private_key,
        )?)
    }

    pub fn create_commitment(&self, amount: U256) -> Result<Commitment> {
        Ok(commitment::create_commitment(amount)?)
    }

    pub fn verify_commitment(&self, commitment: &[u8], amount: U256, blinding: &[u8; 32]) -> bool {
        commitment::verify_commitment(commitment, amount, blinding)
    }

    // ==========================================================================
    // Merkle tree
    // ==========================================================================

    pub async fn merkle_root(&self) -> [u8; 32] {
        self.state.read().await.tree.root()
    }

    pub async fn generate_merkle_proof(&self, leaf_index: u64) -> Result<MerkleProof> {
        Ok(self.state.read().await.tree.generate_proof(leaf_index)?)
    }

    /// Compare the local root with the pool's current root.
    pub async fn verify_root_against_chain(&self) -> Result<bool> {
        let local = self.merkle_root().await;
        let on_chain = self.pool.merkle_root().await?;
        if local != on_chain {
            warn!(
                local = %hex::encode(local),
                on_chain = %hex::encode(on_chain),
                "merkle root mismatch"
            );
        }
        Ok(local == on_chain)
    }

    // ==========================================================================
    // Deposits
    // ==========================================================================

    pub async fn prepare_deposit(&self, token: Address, amount: U256) -> Result<PreparedDeposit> {
        Ok(PreparedDeposit {
            commitment: self.create_commitment(amount)?,
            token,
            amount,
        })
    }

    /// Approve the pool for `amount` of `token` unless the allowance already
    /// covers it. Returns the approval transaction, if one was sent.
    pub async fn approve_if_needed(&self, token: Address, amount: U256) -> Result<Option<B256>> {
        let owner = self.signer.account();
        let allowance = self.pool.token_allowance(token, owner).await?;
        if allowance >= amount {
            debug!(%token, %allowance, "allowance sufficient");
            return Ok(None);
        }
        let tx_hash = self.pool.approve_token(token, amount).await?;
        let receipt = self.pool.wait_for_transaction(tx_hash).await?;
        if !receipt.success {
            return Err(WalletError::TransactionReverted { hash: tx_hash });
        }
        info!(%token, %amount, tx = %tx_hash, "token approved");
        Ok(Some(tx_hash))
    }

    /// Deposit into the pool and record the resulting note.
    ///
    /// All-or-nothing: if the write fails or the receipt reports failure,
    /// nothing local changes. Commitments other depositors added since the
    /// last sync go into the tree first, so the note's leaf index is the
    /// pool's.
    pub async fn execute_deposit(&self, token: Address, amount: U256, commitment: &Commitment) -> Result<DepositOutcome> {
        if commitment.amount != amount {
            return Err(CryptoError::AmountMismatch {
                input: amount.to_string(),
                outputs: commitment.amount.to_string(),
            }
            .into());
        }
        if !self.verify_commitment(&commitment.commitment, amount, &commitment.blinding) {
            return Err(CryptoError::InvalidPoint.into());
        }

        let _op = self.op_lock.lock().await;
        let spend_private_key = Zeroizing::new(self.state.read().await.keys()?.spend_private_key);
        let leaf = commitment.leaf();

        let tx_hash = self
            .pool
            .deposit(token, amount, leaf, Bytes::new())
            .await
            .map_err(|e| {
                error!(error = %e, "deposit transaction failed");
                WalletError::DepositFailed(e.to_string())
            })?;
        let receipt = self
            .pool
            .wait_for_transaction(tx_hash)
            .await
            .map_err(|e| WalletError::DepositFailed(e.to_string()))?;
        if !receipt.success {
            error!(tx = %tx_hash, "deposit reverted");
            return Err(WalletError::DepositFailed(format!("transaction {tx_hash} reverted")));
        }

        let ahead = self.leaves_ahead_of(leaf, receipt.block_number).await;
        let note = {
            let mut state = self.state.write().await;
            match &ahead {
                Some(ahead) => {
                    for earlier in ahead {
                        state.tree.insert_leaf(*earlier)?;
                    }
                    if !ahead.is_empty() {
                        debug!(count = ahead.len(), "caught up on commitments ahead of deposit");
                    }
                }
                None => warn!(tx = %tx_hash, "deposit event not found, placing note at the local next leaf index"),
            }
            let leaf_index = state.tree.next_leaf_index();
            state.tree.insert_leaf(leaf)?;
            let note = Note::new(
                commitment,
                token,
                leaf_index,
                &spend_private_key,
                receipt.block_number.unwrap_or(0),
            );
            state.notes.push(note.clone());
            note
        };
        info!(tx = %tx_hash, %token, %amount, leaf_index = note.leaf_index, "deposit confirmed");

        self.persist().await;
        Ok(DepositOutcome { tx_hash, note })
    }

    /// Commitments the pool accepted before `leaf` that the local tree has
    /// not seen, in insertion order. `None` if the deposit's own event could
    /// not be found at or before `through_block`.
    async fn leaves_ahead_of(&self, leaf: [u8; 32], through_block: Option<u64>) -> Option<Vec<[u8; 32]>> {
        let from_block = self.state.read().await.last_synced_block.max(self.options.deploy_block);
        let events = match self.pool.account_updated_events(from_block).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, from_block, "could not fetch commitments preceding deposit");
                return None;
            }
        };

        let state = self.state.read().await;
        let mut ahead = Vec::new();
        for event in events
            .iter()
            .filter(|e| through_block.map_or(true, |b| e.block_number <= b))
        {
            if event.commitment == leaf {
                return Some(ahead);
            }
            if state.tree.find_leaf_index(&event.commitment).is_none() && !ahead.contains(&event.commitment) {
                ahead.push(event.commitment);
            }
        }
        None
    }

    // ==========================================================================
    // Spending
    // ==========================================================================

    /// Mark notes spent by nullifier. Returns how many notes changed.
    pub async fn mark_notes_spent(&self, nullifiers: &[[u8; 32]]) -> Result<usize> {
        let _op = self.op_lock.lock().await;
        let count = self.state.write().await.apply_spent(nullifiers);
        if count > 0 {
            info!(count, "notes marked spent");
            self.persist().await;
        }
        Ok(count)
    }

    /// Select notes covering `amount` and shape the prover request for a
    /// withdrawal against the current local root.
    pub async fn build_withdraw_request(
        &self,
        token: Address,
        amount: U256,
        receiver: Address,
    ) -> Result<(WithdrawProofRequest, SelectedNotes)> {
        let state = self.state.read().await;
        let (input_notes, selected) = state.select_inputs(self.selector.as_ref(), token, amount)?;
        let request = WithdrawProofRequest {
            input_notes,
            withdraw_amount: amount,
            receiver,
            token,
            current_root: state.tree.root(),
        };
        Ok((request, selected))
    }

    /// Select, prove, submit, and mark the consumed notes spent.
    pub async fn execute_withdraw(&self, token: Address, amount: U256, receiver: Address) -> Result<WithdrawOutcome> {
        let prover = self.prover()?;

        let _op = self.op_lock.lock().await;
        let (request, selected) = self.build_withdraw_request(token, amount, receiver).await?;
        debug!(inputs = selected.notes.len(), total = %selected.total, "requesting withdraw proof");

        let proof = prover.request_withdraw_proof(&request).await?;
        let tx_hash = self
            .pool
            .withdraw(proof.public_inputs, proof.proof_bytes, receiver)
            .await?;
        self.confirm(tx_hash).await?;

        let spent_nullifiers = self.consume(&selected).await;
        info!(tx = %tx_hash, %token, %amount, %receiver, "withdraw confirmed");
        Ok(WithdrawOutcome {
            tx_hash,
            spent_nullifiers,
            selected_total: selected.total,
        })
    }

    /// Shape a private transfer paying `outputs` in `token`. Whatever the
    /// selected notes hold beyond the outputs is added as a change output to
    /// this wallet's spend key.
    pub async fn build_transfer_request(
        &self,
        token: Address,
        outputs: Vec<ProofOutputNote>,
    ) -> Result<(TransactionProofRequest, SelectedNotes, U256)> {
        let amount = outputs.iter().fold(U256::ZERO, |acc, o| acc.saturating_add(o.amount));
        if outputs.is_empty() || amount.is_zero() {
            return Err(WalletError::InvalidRequest("transfer needs a non-zero output".into()));
        }

        let state = self.state.read().await;
        let spend_public_key = state.keys()?.spend_public_key;
        let (input_notes, selected) = state.select_inputs(self.selector.as_ref(), token, amount)?;
        let change = selected.total - amount;
        let mut output_notes = outputs;
        if !change.is_zero() {
            output_notes.push(ProofOutputNote {
                amount: change,
                recipient_public_key: Bytes::copy_from_slice(&spend_public_key),
            });
        }

        let request = TransactionProofRequest {
            input_notes,
            output_notes,
            current_root: state.tree.root(),
        };
        Ok((request, selected, change))
    }

    /// Private transfer: prove, submit through `transact`, mark the inputs
    /// spent. Output blindings are chosen by the prover, so the outputs
    /// (change included) are not added to the local notes.
    pub async fn execute_transfer(&self, token: Address, outputs: Vec<ProofOutputNote>) -> Result<SpendOutcome> {
        let prover = self.prover()?;

        let _op = self.op_lock.lock().await;
        let (request, selected, change) = self.build_transfer_request(token, outputs).await?;
        debug!(
            inputs = request.input_notes.len(),
            outputs = request.output_notes.len(),
            "requesting transaction proof"
        );

        let proof = prover.request_transaction_proof(&request).await?;
        let tx_hash = self.pool.transact(proof.public_inputs, proof.proof_bytes).await?;
        let receipt = self.confirm(tx_hash).await?;

        let spent_nullifiers = self.consume(&selected).await;
        let new_commitments = self.transaction_outputs(tx_hash, receipt.block_number).await;
        info!(tx = %tx_hash, %token, %change, outputs = new_commitments.len(), "transfer confirmed");
        Ok(SpendOutcome {
            tx_hash,
            spent_nullifiers,
            selected_total: selected.total,
            change,
            new_commitments,
        })
    }

    /// Shape one side of a dark-pool match. The wallet receives
    /// `min_amount_out` of `token_out` and any `token_in` change.
    pub async fn build_swap_request(&self, order: SwapOrder) -> Result<(SwapProofRequest, SelectedNotes, U256)> {
        if order.amount_in.is_zero() || order.token_in == order.token_out {
            return Err(WalletError::InvalidRequest(
                "swap needs a non-zero amount between two different tokens".into(),
            ));
        }

        let state = self.state.read().await;
        let own_key = Bytes::copy_from_slice(&state.keys()?.spend_public_key);
        let (input_notes, selected) = state.select_inputs(self.selector.as_ref(), order.token_in, order.amount_in)?;
        let change = selected.total - order.amount_in;

        let mut output_notes = vec![ProofOutputNote {
            amount: order.min_amount_out,
            recipient_public_key: own_key.clone(),
        }];
        if !change.is_zero() {
            output_notes.push(ProofOutputNote {
                amount: change,
                recipient_public_key: own_key,
            });
        }

        let request = SwapProofRequest {
            input_notes,
            output_notes,
            token_in: order.token_in,
            token_out: order.token_out,
            amount_in: order.amount_in,
            min_amount_out: order.min_amount_out,
            current_root: state.tree.root(),
        };
        Ok((request, selected, change))
    }

    pub async fn execute_swap(&self, order: SwapOrder) -> Result<SpendOutcome> {
        let prover = self.prover()?;

        let _op = self.op_lock.lock().await;
        let (request, selected, change) = self.build_swap_request(order).await?;
        let proof = prover.request_swap_proof(&request).await?;
        let tx_hash = self.pool.execute_swap(proof.public_inputs, proof.proof_bytes).await?;
        self.confirm(tx_hash).await?;

        let spent_nullifiers = self.consume(&selected).await;
        info!(
            tx = %tx_hash,
            token_in = %order.token_in,
            token_out = %order.token_out,
            amount_in = %order.amount_in,
            "swap confirmed"
        );
        Ok(SpendOutcome {
            tx_hash,
            spent_nullifiers,
            selected_total: selected.total,
            change,
            new_commitments: Vec::new(),
        })
    }

    /// Withdrawals the pool paid to this wallet's address.
    pub async fn withdrawal_history(&self) -> Result<Vec<WithdrawExecutedEvent>> {
        self.pool
            .withdraw_executed_events(Some(self.signer.account()), self.options.deploy_block)
            .await
    }

    fn prover(&self) -> Result<Arc<dyn ProofService>> {
        self.prover
            .clone()
            .ok_or_else(|| WalletError::Prover("no prover service configured".to_string()))
    }

    async fn confirm(&self, tx_hash: B256) -> Result<TxReceipt> {
        let receipt = self.pool.wait_for_transaction(tx_hash).await?;
        if !receipt.success {
            return Err(WalletError::TransactionReverted { hash: tx_hash });
        }
        Ok(receipt)
    }

    /// Mark the selected inputs spent after a confirmed spend.
    async fn consume(&self, selected: &SelectedNotes) -> Vec<[u8; 32]> {
        let nullifiers: Vec<[u8; 32]> = selected.notes.iter().map(|n| n.nullifier).collect();
        self.state.write().await.apply_spent(&nullifiers);
        self.persist().await;
        nullifiers
    }

    /// Commitments the pool reported for `tx_hash`. Empty when the query
    /// fails; the next sync inserts the leaves either way.
    async fn transaction_outputs(&self, tx_hash: B256, block_number: Option<u64>) -> Vec<[u8; 32]> {
        let from_block = block_number.unwrap_or(self.options.deploy_block);
        match self.pool.transaction_executed_events(from_block).await {
            Ok(events) => events
                .into_iter()
                .filter(|e| e.transaction_hash == Some(tx_hash))
                .flat_map(|e| e.new_commitments)
                .collect(),
            Err(e) => {
                warn!(error = %e, tx = %tx_hash, "could not fetch transaction outputs");
                Vec::new()
            }
        }
    }

    // ==========================================================================
    // Tree repair
    // ==========================================================================

    /// Rebuild the tree from every commitment since the deploy block and
    /// move notes whose recorded leaf index disagrees with the chain,
    /// recomputing their nullifiers. Returns how many notes moved. Nothing
    /// changes unless the rebuilt root equals the pool's root.
    pub async fn rebuild_tree_from_chain(&self) -> Result<usize> {
        let _op = self.op_lock.lock().await;
        let spend_private_key = Zeroizing::new(self.state.read().await.keys()?.spend_private_key);

        let leaves = self.pool.all_commitments(self.options.deploy_block).await?;
        let tree = MerkleTree::create_from_commitments(self.options.tree_levels, &leaves)?;
        let on_chain = self.pool.merkle_root().await?;
        if tree.root() != on_chain {
            return Err(WalletError::RootMismatch {
                local: B256::from(tree.root()),
                on_chain: B256::from(on_chain),
            });
        }

        let moved = {
            let mut state = self.state.write().await;
            let mut moved = 0;
            for note in state.notes.iter_mut() {
                match tree.find_leaf_index(&note.commitment) {
                    Some(index) if index != note.leaf_index => {
                        debug!(from = note.leaf_index, to = index, "note moved");
                        note.leaf_index = index;
                        note.nullifier = compute_nullifier(&spend_private_key, index, &note.commitment);
                        moved += 1;
                    }
                    Some(_) => {}
                    None => warn!(leaf_index = note.leaf_index, "note commitment not on chain"),
                }
            }
            state.tree = tree;
            moved
        };
        info!(leaves = leaves.len(), moved, "tree rebuilt from chain");

        self.persist().await;
        Ok(moved)
    }

    // ==========================================================================
    // Chain sync
    // ==========================================================================

    /// Pull new commitments into the tree and detect spent notes.
    ///
    /// A fresh wallet (no notes, never synced) skips the scan. Chain query
    /// failures stop the sync, are logged, and are reported in
    /// [`SyncReport::transport_error`]; whatever was already applied stays.
    pub async fn sync_with_chain(&self) -> Result<SyncReport> {
        let _op = self.op_lock.lock().await;

        let (from_block, last_synced_block) = {
            let state = self.state.read().await;
            state.keys()?;
            if state.notes.is_empty() && state.last_synced_block == 0 {
                debug!("skipping initial sync, no local notes to verify");
                return Ok(SyncReport {
                    skipped: true,
                    ..SyncReport::default()
                });
            }
            (
                state.last_synced_block.max(self.options.deploy_block),
                state.last_synced_block,
            )
        };
        let mut report = SyncReport {
            last_synced_block,
            ..SyncReport::default()
        };

        let events = match self.pool.account_updated_events(from_block).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, from_block, "sync aborted fetching commitments");
                report.transport_error = Some(e.to_string());
                return Ok(report);
            }
        };

        let tree_error = {
            let mut state = self.state.write().await;
            let mut tree_error = None;
            for event in &events {
                if state.tree.find_leaf_index(&event.commitment).is_some() {
                    continue;
                }
                if let Err(e) = state.tree.insert_leaf(event.commitment) {
                    tree_error = Some(e);
                    break;
                }
                report.inserted_leaves += 1;
            }
            if tree_error.is_none() {
                if let Some(last) = events.last() {
                    state.last_synced_block = state.last_synced_block.max(last.block_number + 1);
                }
            }
            report.last_synced_block = state.last_synced_block;
            tree_error
        };
        if let Some(e) = tree_error {
            self.persist().await;
            return Err(e.into());
        }

        let pending: Vec<[u8; 32]> = self.state.read().await.unspent().map(|n| n.nullifier).collect();
        let mut used = Vec::new();
        for nullifier in pending {
            match self.pool.is_nullifier_used(nullifier).await {
                Ok(true) => used.push(nullifier),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "sync aborted checking nullifiers");
                    report.transport_error = Some(e.to_string());
                    break;
                }
            }
        }
        if !used.is_empty() {
            report.newly_spent = self.state.write().await.apply_spent(&used);
        }

        self.persist().await;
        info!(
            inserted = report.inserted_leaves,
            spent = report.newly_spent,
            last_synced_block = report.last_synced_block,
            "synced with chain"
        );
        Ok(report)
    }
}
