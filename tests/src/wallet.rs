use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use shielded_wallet_lib::{curve, stealth, verify_proof, CryptoError, MerkleTree, Note, ProofOutputNote, TREE_DEPTH};
use shielded_wallet_script::error::classify_signer_error;
use shielded_wallet_script::keystore::KdfParams;
use shielded_wallet_script::storage::{self, MemoryStore, StateStore};
use shielded_wallet_script::{PrivacyWallet, Result, SwapOrder, WalletError, WalletOptions, WalletSigner};

use crate::mock::{MockPool, MockProver};

const TOKEN: Address = Address::repeat_byte(0x70);
const OTHER_TOKEN: Address = Address::repeat_byte(0x71);

const FAST_KDF: KdfParams = KdfParams {
    m_cost: 256,
    t_cost: 1,
    p_cost: 1,
};

/// Wraps a local key and counts signature prompts.
struct CountingSigner {
    inner: PrivateKeySigner,
    prompts: AtomicUsize,
}

impl CountingSigner {
    fn new(inner: PrivateKeySigner) -> Arc<Self> {
        Arc::new(CountingSigner {
            inner,
            prompts: AtomicUsize::new(0),
        })
    }

    fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletSigner for CountingSigner {
    fn account(&self) -> Address {
        self.inner.account()
    }

    async fn request_signature(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.inner.request_signature(message).await
    }
}

struct RejectingSigner;

#[async_trait]
impl WalletSigner for RejectingSigner {
    fn account(&self) -> Address {
        Address::repeat_byte(0xee)
    }

    async fn request_signature(&self, _message: &[u8]) -> Result<Vec<u8>> {
        Err(classify_signer_error("MetaMask Tx Signature: User denied message signature."))
    }
}

struct SilentSigner;

#[async_trait]
impl WalletSigner for SilentSigner {
    fn account(&self) -> Address {
        Address::repeat_byte(0xdd)
    }

    async fn request_signature(&self, _message: &[u8]) -> Result<Vec<u8>> {
        std::future::pending().await
    }
}

struct Harness {
    wallet: PrivacyWallet,
    pool: Arc<MockPool>,
    store: Arc<MemoryStore>,
}

fn wallet_on(
    signer: Arc<dyn WalletSigner>,
    pool: &Arc<MockPool>,
    store: &Arc<MemoryStore>,
    options: WalletOptions,
) -> PrivacyWallet {
    PrivacyWallet::new(signer, pool.clone(), store.clone(), options).unwrap()
}

async fn initialized() -> Harness {
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    let wallet = wallet_on(Arc::new(PrivateKeySigner::random()), &pool, &store, WalletOptions::default());
    wallet.initialize().await.unwrap();
    Harness { wallet, pool, store }
}

async fn deposit(wallet: &PrivacyWallet, token: Address, amount: u64) -> Note {
    let amount = U256::from(amount);
    let commitment = wallet.create_commitment(amount).unwrap();
    wallet.execute_deposit(token, amount, &commitment).await.unwrap().note
}

fn amounts(notes: &[Note]) -> Vec<u64> {
    notes.iter().map(|n| n.amount.to::<u64>()).collect()
}

// ---------------------------------------------------------------------------
// Note lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_deposit_then_spend_lifecycle() {
    let h = initialized().await;

    let note = deposit(&h.wallet, TOKEN, 100).await;
    assert_eq!(note.leaf_index, 0);
    assert!(!note.spent);
    assert_eq!(h.wallet.get_shielded_balance().await, U256::from(100u8));
    assert_eq!(h.wallet.get_unspent_notes().await.len(), 1);

    assert_eq!(h.wallet.mark_notes_spent(&[note.nullifier]).await.unwrap(), 1);
    assert_eq!(h.wallet.get_shielded_balance().await, U256::ZERO);
    assert!(h.wallet.all_notes().await[0].spent);

    // already spent, and unknown nullifiers, change nothing
    assert_eq!(h.wallet.mark_notes_spent(&[note.nullifier, [9u8; 32]]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_deposit_tracks_tree_and_chain() {
    let h = initialized().await;
    let a = deposit(&h.wallet, TOKEN, 7).await;
    let b = deposit(&h.wallet, TOKEN, 9).await;

    assert_eq!((a.leaf_index, b.leaf_index), (0, 1));
    assert_eq!(h.wallet.merkle_root().await, h.pool.with(|l| l.tree.root()));
    assert!(h.wallet.verify_root_against_chain().await.unwrap());

    let proof = h.wallet.generate_merkle_proof(1).await.unwrap();
    assert_eq!(proof.leaf, b.commitment);
    assert!(proof.verify(&h.wallet.merkle_root().await));
}

#[tokio::test]
async fn test_balances_split_by_token() {
    let h = initialized().await;
    deposit(&h.wallet, TOKEN, 5).await;
    deposit(&h.wallet, OTHER_TOKEN, 8).await;
    deposit(&h.wallet, TOKEN, 6).await;

    let balances = h.wallet.balance_by_token().await;
    assert_eq!(balances[&TOKEN], U256::from(11u8));
    assert_eq!(balances[&OTHER_TOKEN], U256::from(8u8));
    assert_eq!(h.wallet.get_shielded_balance().await, U256::from(19u8));
    assert_eq!(amounts(&h.wallet.notes_for_token(OTHER_TOKEN).await), vec![8]);
}

#[tokio::test]
async fn test_notes_for_token_excludes_spent() {
    let h = initialized().await;
    let spent = deposit(&h.wallet, TOKEN, 5).await;
    deposit(&h.wallet, TOKEN, 6).await;
    h.wallet.mark_notes_spent(&[spent.nullifier]).await.unwrap();

    assert_eq!(amounts(&h.wallet.notes_for_token(TOKEN).await), vec![6]);
}

#[tokio::test]
async fn test_greedy_selection_picks_largest_first() {
    let h = initialized().await;
    for amount in [10, 40, 5, 100] {
        deposit(&h.wallet, TOKEN, amount).await;
    }
    deposit(&h.wallet, OTHER_TOKEN, 1000).await;

    let selected = h.wallet.select_notes_for_amount(TOKEN, U256::from(60u8)).await;
    assert_eq!(amounts(&selected.notes), vec![100]);
    assert_eq!(selected.total, U256::from(100u8));

    let selected = h.wallet.select_notes_for_amount(TOKEN, U256::from(145u8)).await;
    assert_eq!(amounts(&selected.notes), vec![100, 40, 10]);
}

// ---------------------------------------------------------------------------
// Deposit failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_deposit_changes_nothing() {
    let h = initialized().await;
    let empty_root = h.wallet.merkle_root().await;
    let commitment = h.wallet.create_commitment(U256::from(50u8)).unwrap();

    h.pool.with(|l| l.fail_deposit = true);
    let err = h.wallet.execute_deposit(TOKEN, U256::from(50u8), &commitment).await.unwrap_err();
    assert!(matches!(err, WalletError::DepositFailed(_)));

    h.pool.with(|l| {
        l.fail_deposit = false;
        l.revert_deposit = true;
    });
    let err = h.wallet.execute_deposit(TOKEN, U256::from(50u8), &commitment).await.unwrap_err();
    assert!(matches!(err, WalletError::DepositFailed(_)));

    let snapshot = h.wallet.snapshot().await;
    assert!(snapshot.notes.is_empty());
    assert_eq!(snapshot.merkle_root, empty_root);
    assert_eq!(snapshot.next_leaf_index, 0);
    assert_eq!(h.store.get(storage::NOTES).await.unwrap(), None);
}

#[tokio::test]
async fn test_mismatched_amount_never_reaches_chain() {
    let h = initialized().await;
    let commitment = h.wallet.create_commitment(U256::from(100u8)).unwrap();

    let err = h.wallet.execute_deposit(TOKEN, U256::from(99u8), &commitment).await.unwrap_err();
    assert!(matches!(err, WalletError::Crypto(CryptoError::AmountMismatch { .. })));
    assert_eq!(h.pool.with(|l| l.deposits_sent), 0);
}

#[tokio::test]
async fn test_deposit_after_foreign_deposits_lands_at_chain_index() {
    let pool = Arc::new(MockPool::new());
    pool.append_external([0xab; 32]);
    pool.append_external([0xcd; 32]);
    let store = Arc::new(MemoryStore::new());
    let wallet = wallet_on(Arc::new(PrivateKeySigner::random()), &pool, &store, WalletOptions::default());
    wallet.initialize().await.unwrap();

    let note = deposit(&wallet, TOKEN, 100).await;
    assert_eq!(note.leaf_index, 2);
    assert_eq!(Some(note.leaf_index), pool.with(|l| l.tree.find_leaf_index(&note.commitment)));
    assert!(wallet.verify_root_against_chain().await.unwrap());

    pool.append_external([0xef; 32]);
    let report = wallet.sync_with_chain().await.unwrap();
    assert_eq!(report.inserted_leaves, 1);
    assert!(wallet.verify_root_against_chain().await.unwrap());

    let proof = wallet.generate_merkle_proof(note.leaf_index).await.unwrap();
    assert_eq!(proof.leaf, note.commitment);
    assert!(proof.verify(&pool.with(|l| l.tree.root())));
}

#[tokio::test]
async fn test_approve_only_when_allowance_short() {
    let h = initialized().await;
    assert!(h.wallet.approve_if_needed(TOKEN, U256::from(10u8)).await.unwrap().is_some());
    assert!(h.wallet.approve_if_needed(TOKEN, U256::from(10u8)).await.unwrap().is_none());
    assert!(h.wallet.approve_if_needed(TOKEN, U256::from(11u8)).await.unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fresh_wallet_skips_event_scan() {
    let h = initialized().await;
    assert_eq!(h.pool.with(|l| l.event_queries), 0);

    let report = h.wallet.sync_with_chain().await.unwrap();
    assert!(report.skipped);
    assert_eq!(h.pool.with(|l| (l.event_queries, l.nullifier_queries)), (0, 0));
}

#[tokio::test]
async fn test_sync_inserts_external_commitments() {
    let h = initialized().await;
    deposit(&h.wallet, TOKEN, 10).await;
    h.pool.append_external([0xab; 32]);
    h.pool.append_external([0xcd; 32]);

    let report = h.wallet.sync_with_chain().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.inserted_leaves, 2);
    assert_eq!(report.last_synced_block, h.pool.with(|l| l.block) + 1);
    assert!(report.transport_error.is_none());
    assert!(h.wallet.verify_root_against_chain().await.unwrap());
}

#[tokio::test]
async fn test_second_sync_changes_nothing() {
    let h = initialized().await;
    deposit(&h.wallet, TOKEN, 10).await;
    deposit(&h.wallet, TOKEN, 20).await;
    h.pool.append_external([0x11; 32]);
    h.wallet.sync_with_chain().await.unwrap();

    let before = h.wallet.snapshot().await;
    let report = h.wallet.sync_with_chain().await.unwrap();
    let after = h.wallet.snapshot().await;

    assert_eq!(report.inserted_leaves, 0);
    assert_eq!(report.newly_spent, 0);
    assert_eq!(before.last_synced_block, after.last_synced_block);
    assert_eq!(before.merkle_root, after.merkle_root);
    let spent = |notes: &[Note]| notes.iter().map(|n| n.spent).collect::<Vec<_>>();
    assert_eq!(spent(&before.notes), spent(&after.notes));
}

#[tokio::test]
async fn test_sync_detects_notes_spent_elsewhere() {
    let h = initialized().await;
    let spent = deposit(&h.wallet, TOKEN, 30).await;
    deposit(&h.wallet, TOKEN, 12).await;
    h.pool.spend_externally(spent.nullifier);

    let report = h.wallet.sync_with_chain().await.unwrap();
    assert_eq!(report.newly_spent, 1);
    assert_eq!(h.wallet.get_shielded_balance().await, U256::from(12u8));
}

#[tokio::test]
async fn test_sync_transport_failure_keeps_applied_state() {
    let h = initialized().await;
    deposit(&h.wallet, TOKEN, 10).await;

    h.pool.with(|l| l.fail_events = true);
    let report = h.wallet.sync_with_chain().await.unwrap();
    assert!(report.transport_error.is_some());
    assert_eq!(report.last_synced_block, 0);
    assert_eq!(h.wallet.get_unspent_notes().await.len(), 1);

    // commitments arrive, then the nullifier checks fail
    h.pool.append_external([0x22; 32]);
    h.pool.with(|l| {
        l.fail_events = false;
        l.fail_nullifiers = true;
    });
    let report = h.wallet.sync_with_chain().await.unwrap();
    assert!(report.transport_error.is_some());
    assert_eq!(report.inserted_leaves, 1);
    assert!(h.wallet.verify_root_against_chain().await.unwrap());
    assert_eq!(h.wallet.get_unspent_notes().await.len(), 1);
}

#[tokio::test]
async fn test_sync_respects_deploy_block() {
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    let options = WalletOptions {
        deploy_block: 1_000,
        ..WalletOptions::default()
    };
    let wallet = wallet_on(Arc::new(PrivateKeySigner::random()), &pool, &store, options);
    wallet.initialize().await.unwrap();
    deposit(&wallet, TOKEN, 1).await;
    pool.append_external([0x33; 32]);

    // nothing on the mock chain is past block 1000
    let report = wallet.sync_with_chain().await.unwrap();
    assert_eq!(report.inserted_leaves, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_syncs_and_deposits_never_double_insert() {
    let Harness { wallet, pool, .. } = initialized().await;
    deposit(&wallet, TOKEN, 10).await;

    let appender = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for i in 0..6u8 {
                pool.append_external([0x40 + i; 32]);
                tokio::task::yield_now().await;
            }
        })
    };
    let (a, b, _, c) = tokio::join!(
        wallet.sync_with_chain(),
        wallet.sync_with_chain(),
        deposit(&wallet, TOKEN, 20),
        wallet.sync_with_chain(),
    );
    appender.await.unwrap();
    for report in [a, b, c] {
        assert!(report.unwrap().transport_error.is_none());
    }
    wallet.sync_with_chain().await.unwrap();

    let (chain_leaves, chain_root) = pool.with(|l| (l.tree.leaves(), l.tree.root()));
    assert_eq!(chain_leaves.len(), 8);
    let snapshot = wallet.snapshot().await;
    assert_eq!(snapshot.next_leaf_index, 8);
    assert_eq!(snapshot.merkle_root, chain_root);
    for note in &snapshot.notes {
        assert_eq!(chain_leaves[note.leaf_index as usize], note.commitment);
    }
}

// ---------------------------------------------------------------------------
// Initialization and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_uninitialized_wallet_refuses_operations() {
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    let wallet = wallet_on(Arc::new(PrivateKeySigner::random()), &pool, &store, WalletOptions::default());
    let commitment = wallet.create_commitment(U256::from(1u8)).unwrap();

    assert!(!wallet.is_initialized().await);
    assert!(matches!(wallet.public_keys().await, Err(WalletError::NotInitialized)));
    assert!(matches!(wallet.sync_with_chain().await, Err(WalletError::NotInitialized)));
    assert!(matches!(
        wallet.execute_deposit(TOKEN, U256::from(1u8), &commitment).await,
        Err(WalletError::NotInitialized)
    ));
    assert!(matches!(wallet.generate_receive_address().await, Err(WalletError::NotInitialized)));
    assert_eq!(wallet.get_shielded_balance().await, U256::ZERO);
    assert_eq!(pool.with(|l| l.deposits_sent), 0);
}

#[test]
fn test_unsupported_tree_depth_is_rejected() {
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    for levels in [0, 64] {
        let options = WalletOptions {
            tree_levels: levels,
            ..WalletOptions::default()
        };
        let result = PrivacyWallet::new(Arc::new(PrivateKeySigner::random()), pool.clone(), store.clone(), options);
        assert!(matches!(
            result.err(),
            Some(WalletError::Crypto(CryptoError::UnsupportedDepth(l))) if l == levels
        ));
    }
}

#[tokio::test]
async fn test_initialize_twice_is_noop() {
    let signer = CountingSigner::new(PrivateKeySigner::random());
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    let wallet = wallet_on(signer.clone(), &pool, &store, WalletOptions::default());

    wallet.initialize().await.unwrap();
    wallet.initialize().await.unwrap();
    assert_eq!(signer.prompts(), 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let key = PrivateKeySigner::random();
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());

    let first = wallet_on(Arc::new(key.clone()), &pool, &store, WalletOptions::default());
    first.initialize().await.unwrap();
    let note = deposit(&first, TOKEN, 77).await;
    let root = first.merkle_root().await;
    let keys = first.public_keys().await.unwrap();
    drop(first);

    let second = wallet_on(Arc::new(key), &pool, &store, WalletOptions::default());
    second.initialize().await.unwrap();
    assert_eq!(second.all_notes().await, vec![note]);
    assert_eq!(second.merkle_root().await, root);
    assert_eq!(second.public_keys().await.unwrap(), keys);
    assert_eq!(second.get_shielded_balance().await, U256::from(77u8));
}

#[tokio::test]
async fn test_plaintext_keys_never_persisted() {
    let h = initialized().await;
    deposit(&h.wallet, TOKEN, 1).await;
    assert_eq!(h.store.get(storage::WALLET_KEYS).await.unwrap(), None);
}

#[tokio::test]
async fn test_sealed_keys_avoid_second_prompt() {
    let key = PrivateKeySigner::random();
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    let options = WalletOptions {
        keystore_passphrase: Some("hunter2".into()),
        keystore_kdf: FAST_KDF,
        ..WalletOptions::default()
    };

    let first_signer = CountingSigner::new(key.clone());
    let first = wallet_on(first_signer.clone(), &pool, &store, options.clone());
    first.initialize().await.unwrap();
    assert_eq!(first_signer.prompts(), 1);
    let keys = first.public_keys().await.unwrap();

    let raw = store.get(storage::WALLET_KEYS).await.unwrap().unwrap();
    assert!(raw.contains("ciphertext"));

    let second_signer = CountingSigner::new(key.clone());
    let second = wallet_on(second_signer.clone(), &pool, &store, options);
    second.initialize().await.unwrap();
    assert_eq!(second_signer.prompts(), 0);
    assert_eq!(second.public_keys().await.unwrap(), keys);

    // a wrong passphrase falls back to signing
    let third_signer = CountingSigner::new(key);
    let wrong = WalletOptions {
        keystore_passphrase: Some("wrong".into()),
        keystore_kdf: FAST_KDF,
        ..WalletOptions::default()
    };
    let third = wallet_on(third_signer.clone(), &pool, &store, wrong);
    third.initialize().await.unwrap();
    assert_eq!(third_signer.prompts(), 1);
    assert_eq!(third.public_keys().await.unwrap(), keys);
}

#[tokio::test]
async fn test_corrupt_storage_degrades_to_empty() {
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    store.put(storage::NOTES, "[{\"amount\":").await.unwrap();
    store.put(storage::MERKLE_TREE, "null").await.unwrap();
    store.put(storage::LAST_SYNCED_BLOCK, "\"-4\"").await.unwrap();

    let wallet = wallet_on(Arc::new(PrivateKeySigner::random()), &pool, &store, WalletOptions::default());
    wallet.initialize().await.unwrap();

    let snapshot = wallet.snapshot().await;
    assert!(snapshot.is_initialized);
    assert!(snapshot.notes.is_empty());
    assert_eq!(snapshot.merkle_root, MerkleTree::new(TREE_DEPTH).root());
    assert_eq!(snapshot.last_synced_block, 0);
}

#[tokio::test]
async fn test_clear_storage_resets_wallet() {
    let h = initialized().await;
    deposit(&h.wallet, TOKEN, 3).await;
    assert!(h.store.get(storage::NOTES).await.unwrap().is_some());

    h.wallet.clear_storage().await.unwrap();
    assert!(!h.wallet.is_initialized().await);
    for key in storage::ALL_KEYS {
        assert_eq!(h.store.get(key).await.unwrap(), None);
    }

    h.wallet.initialize().await.unwrap();
    assert!(h.wallet.all_notes().await.is_empty());
}

// ---------------------------------------------------------------------------
// Signature boundary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rejected_signature_is_reported_distinctly() {
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    let wallet = wallet_on(Arc::new(RejectingSigner), &pool, &store, WalletOptions::default());

    let err = wallet.initialize().await.unwrap_err();
    assert!(err.is_user_rejection());
    assert!(err.user_message().contains("retry"));
    assert!(!wallet.is_initialized().await);
}

#[tokio::test]
async fn test_pending_signature_does_not_block_reads() {
    let pool = Arc::new(MockPool::new());
    let store = Arc::new(MemoryStore::new());
    let options = WalletOptions {
        signature_timeout: Duration::from_millis(300),
        ..WalletOptions::default()
    };
    let wallet = Arc::new(wallet_on(Arc::new(SilentSigner), &pool, &store, options));

    let init = tokio::spawn({
        let wallet = wallet.clone();
        async move { wallet.initialize().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let balance = tokio::time::timeout(Duration::from_millis(100), wallet.get_shielded_balance())
        .await
        .expect("balance read blocked by signature prompt");
    assert_eq!(balance, U256::ZERO);

    let err = init.await.unwrap().unwrap_err();
    assert!(err.is_user_rejection());
}

// ---------------------------------------------------------------------------
// Withdraw
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_withdraw_spends_selected_notes() {
    let h = initialized().await;
    let prover = Arc::new(MockProver::default());
    let wallet = h.wallet.with_prover(prover.clone());

    deposit(&wallet, TOKEN, 30).await;
    deposit(&wallet, TOKEN, 50).await;
    let kept = deposit(&wallet, TOKEN, 5).await;
    let receiver = Address::repeat_byte(0x99);

    let outcome = wallet.execute_withdraw(TOKEN, U256::from(60u8), receiver).await.unwrap();
    assert_eq!(outcome.spent_nullifiers.len(), 2);
    assert_eq!(outcome.selected_total, U256::from(80u8));
    assert_eq!(amounts(&wallet.get_unspent_notes().await), vec![5]);
    assert_eq!(wallet.get_unspent_notes().await[0].nullifier, kept.nullifier);

    let requests = prover.requests.lock().unwrap();
    let request = &requests[0];
    assert_eq!(request.receiver, receiver);
    assert_eq!(request.withdraw_amount, U256::from(60u8));
    assert_eq!(request.input_notes.len(), 2);
    for input in &request.input_notes {
        assert!(verify_proof(
            &input.commitment,
            &input.path_elements,
            &input.path_indices,
            &request.current_root
        ));
    }
    assert_eq!(h.pool.with(|l| l.withdrawals.len()), 1);
}

#[tokio::test]
async fn test_prover_failure_leaves_notes_unspent() {
    let h = initialized().await;
    let wallet = h.wallet.with_prover(Arc::new(MockProver {
        fail: true,
        ..MockProver::default()
    }));
    deposit(&wallet, TOKEN, 40).await;

    let err = wallet.execute_withdraw(TOKEN, U256::from(40u8), Address::ZERO).await.unwrap_err();
    assert!(matches!(err, WalletError::Prover(_)));
    assert_eq!(wallet.get_shielded_balance().await, U256::from(40u8));
    assert!(h.pool.with(|l| l.withdrawals.is_empty()));
}

#[tokio::test]
async fn test_reverted_withdraw_leaves_notes_unspent() {
    let h = initialized().await;
    let wallet = h.wallet.with_prover(Arc::new(MockProver::default()));
    deposit(&wallet, TOKEN, 40).await;
    h.pool.with(|l| l.revert_withdraw = true);

    let err = wallet.execute_withdraw(TOKEN, U256::from(40u8), Address::ZERO).await.unwrap_err();
    assert!(matches!(err, WalletError::TransactionReverted { .. }));
    assert_eq!(wallet.get_shielded_balance().await, U256::from(40u8));
}

#[tokio::test]
async fn test_withdraw_beyond_balance_is_insufficient() {
    let h = initialized().await;
    let wallet = h.wallet.with_prover(Arc::new(MockProver::default()));
    deposit(&wallet, TOKEN, 10).await;
    deposit(&wallet, OTHER_TOKEN, 100).await;

    match wallet.execute_withdraw(TOKEN, U256::from(50u8), Address::ZERO).await {
        Err(WalletError::InsufficientFunds { available, needed }) => {
            assert_eq!(available, U256::from(10u8));
            assert_eq!(needed, U256::from(50u8));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_withdraw_without_prover_fails_fast() {
    let h = initialized().await;
    deposit(&h.wallet, TOKEN, 10).await;
    let err = h.wallet.execute_withdraw(TOKEN, U256::from(5u8), Address::ZERO).await.unwrap_err();
    assert!(matches!(err, WalletError::Prover(_)));
}

#[tokio::test]
async fn test_withdrawal_history_lists_own_withdrawals() {
    let h = initialized().await;
    let own = h.wallet.address();
    let wallet = h.wallet.with_prover(Arc::new(MockProver::default()));
    deposit(&wallet, TOKEN, 10).await;
    deposit(&wallet, TOKEN, 20).await;

    wallet.execute_withdraw(TOKEN, U256::from(20u8), own).await.unwrap();
    wallet.execute_withdraw(TOKEN, U256::from(10u8), Address::repeat_byte(0x98)).await.unwrap();

    let history = wallet.withdrawal_history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].receiver, own);
    assert_eq!(h.pool.with(|l| l.withdrawals.len()), 2);
}

// ---------------------------------------------------------------------------
// Transfers and swaps
// ---------------------------------------------------------------------------

fn pay(amount: u64) -> ProofOutputNote {
    ProofOutputNote {
        amount: U256::from(amount),
        recipient_public_key: Bytes::copy_from_slice(&[0x02; 33]),
    }
}

#[tokio::test]
async fn test_transfer_pays_outputs_and_returns_change() {
    let h = initialized().await;
    let prover = Arc::new(MockProver::default());
    let wallet = h.wallet.with_prover(prover.clone());
    deposit(&wallet, TOKEN, 100).await;
    deposit(&wallet, TOKEN, 30).await;
    let root_before = wallet.merkle_root().await;
    let own_key = Bytes::copy_from_slice(&wallet.public_keys().await.unwrap().spend_public_key);

    let outcome = wallet.execute_transfer(TOKEN, vec![pay(110)]).await.unwrap();
    assert_eq!(outcome.selected_total, U256::from(130u8));
    assert_eq!(outcome.change, U256::from(20u8));
    assert_eq!(outcome.spent_nullifiers.len(), 2);
    assert_eq!(outcome.new_commitments, h.pool.with(|l| l.transactions[0].new_commitments.clone()));
    assert_eq!(wallet.get_shielded_balance().await, U256::ZERO);

    {
        let requests = prover.transaction_requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.current_root, root_before);
        assert_eq!(request.input_notes.len(), 2);
        assert_eq!(request.output_notes[0], pay(110));
        assert_eq!(request.output_notes[1].amount, U256::from(20u8));
        assert_eq!(request.output_notes[1].recipient_public_key, own_key);
    }

    // the outputs reach the tree through the next sync
    let report = wallet.sync_with_chain().await.unwrap();
    assert_eq!(report.inserted_leaves, 2);
    assert!(wallet.verify_root_against_chain().await.unwrap());
}

#[tokio::test]
async fn test_transfer_failures_leave_notes_unspent() {
    let h = initialized().await;
    let wallet = h.wallet.with_prover(Arc::new(MockProver::default()));
    deposit(&wallet, TOKEN, 40).await;

    assert!(matches!(
        wallet.execute_transfer(TOKEN, Vec::new()).await,
        Err(WalletError::InvalidRequest(_))
    ));
    assert!(matches!(
        wallet.execute_transfer(TOKEN, vec![pay(41)]).await,
        Err(WalletError::InsufficientFunds { .. })
    ));

    h.pool.with(|l| l.revert_transact = true);
    assert!(matches!(
        wallet.execute_transfer(TOKEN, vec![pay(40)]).await,
        Err(WalletError::TransactionReverted { .. })
    ));
    assert_eq!(wallet.get_shielded_balance().await, U256::from(40u8));
}

#[tokio::test]
async fn test_swap_spends_token_in_and_pays_wallet() {
    let h = initialized().await;
    let prover = Arc::new(MockProver::default());
    let wallet = h.wallet.with_prover(prover.clone());
    deposit(&wallet, TOKEN, 50).await;
    deposit(&wallet, OTHER_TOKEN, 7).await;
    let own_key = Bytes::copy_from_slice(&wallet.public_keys().await.unwrap().spend_public_key);

    let order = SwapOrder {
        token_in: TOKEN,
        token_out: OTHER_TOKEN,
        amount_in: U256::from(40u8),
        min_amount_out: U256::from(38u8),
    };
    let outcome = wallet.execute_swap(order).await.unwrap();
    assert_eq!(outcome.change, U256::from(10u8));
    assert_eq!(outcome.spent_nullifiers.len(), 1);

    {
        let requests = prover.swap_requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!((request.token_in, request.token_out), (TOKEN, OTHER_TOKEN));
        assert_eq!(request.amount_in, U256::from(40u8));
        let outputs: Vec<_> = request
            .output_notes
            .iter()
            .map(|o| (o.amount.to::<u64>(), o.recipient_public_key.clone()))
            .collect();
        assert_eq!(outputs, vec![(38, own_key.clone()), (10, own_key)]);
    }
    assert!(wallet.notes_for_token(TOKEN).await.is_empty());
    assert_eq!(amounts(&wallet.notes_for_token(OTHER_TOKEN).await), vec![7]);

    let same_token = SwapOrder {
        token_out: TOKEN,
        ..order
    };
    assert!(matches!(
        wallet.execute_swap(same_token).await,
        Err(WalletError::InvalidRequest(_))
    ));
}

// ---------------------------------------------------------------------------
// Tree repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rebuild_moves_note_placed_without_chain_view() {
    let h = initialized().await;
    h.pool.append_external([0xab; 32]);

    // the deposit cannot see the earlier leaf, so it lands at the local index
    h.pool.with(|l| l.fail_events = true);
    let misplaced = deposit(&h.wallet, TOKEN, 25).await;
    assert_eq!(misplaced.leaf_index, 0);
    assert!(!h.wallet.verify_root_against_chain().await.unwrap());

    h.pool.with(|l| l.fail_events = false);
    assert_eq!(h.wallet.rebuild_tree_from_chain().await.unwrap(), 1);

    let note = h.wallet.get_unspent_notes().await.remove(0);
    assert_eq!(note.leaf_index, 1);
    assert_ne!(note.nullifier, misplaced.nullifier);
    assert!(h.wallet.verify_root_against_chain().await.unwrap());
    let proof = h.wallet.generate_merkle_proof(note.leaf_index).await.unwrap();
    assert_eq!(proof.leaf, note.commitment);

    assert_eq!(h.wallet.rebuild_tree_from_chain().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rebuild_refuses_partial_history() {
    let pool = Arc::new(MockPool::new());
    pool.append_external([0xab; 32]);
    let store = Arc::new(MemoryStore::new());
    let options = WalletOptions {
        deploy_block: 2,
        ..WalletOptions::default()
    };
    let wallet = wallet_on(Arc::new(PrivateKeySigner::random()), &pool, &store, options);
    wallet.initialize().await.unwrap();
    let note = deposit(&wallet, TOKEN, 3).await;
    let root = wallet.merkle_root().await;

    let err = wallet.rebuild_tree_from_chain().await.unwrap_err();
    assert!(matches!(err, WalletError::RootMismatch { .. }));
    assert_eq!(wallet.merkle_root().await, root);
    assert_eq!(wallet.all_notes().await, vec![note]);
}

// ---------------------------------------------------------------------------
// Stealth addresses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_receive_address_belongs_to_wallet() {
    let h = initialized().await;
    let other = initialized().await;

    let stealth_address = h.wallet.generate_receive_address().await.unwrap();
    assert!(h.wallet.check_stealth_ownership(&stealth_address).await);
    assert!(!other.wallet.check_stealth_ownership(&stealth_address).await);

    let private_key = h
        .wallet
        .compute_stealth_private_key(&stealth_address.ephemeral_public_key)
        .await
        .unwrap();
    let public = curve::public_key_from_scalar(&curve::parse_secret_scalar(&private_key).unwrap()).unwrap();
    let uncompressed = curve::encode_uncompressed(&curve::parse_point(&public).unwrap()).unwrap();
    assert_eq!(stealth::public_key_to_address(&uncompressed), stealth_address.address);
}

#[tokio::test]
async fn test_snapshot_is_json_safe() {
    let h = initialized().await;
    deposit(&h.wallet, TOKEN, 12).await;

    let json = serde_json::to_value(h.wallet.snapshot().await).unwrap();
    assert_eq!(json["notes"][0]["amount"], "12");
    assert!(json["merkleRoot"].as_str().unwrap().starts_with("0x"));
    assert!(json.to_string().find("PrivateKey").is_none());
}
