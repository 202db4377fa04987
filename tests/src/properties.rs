//! Property tests for the cryptographic core: commitments, stealth
//! addresses and the Merkle accumulator.

use proptest::prelude::*;
use shielded_wallet_lib::{
    check_ownership, compute_stealth_private_key, compute_zeros, create_balanced_commitments, curve, hash_pair,
    recompute_commitment,
    stealth::{generate_stealth_address_with_ephemeral, public_key_to_address},
    verify_balance, verify_balance_with_amounts, verify_commitment, MerkleTree, Opening, U256,
};

const LEVELS: usize = 8;

// Keys below the curve order, never zero.
fn secret_key() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>()).prop_filter("valid secret scalar", |bytes| {
        curve::parse_secret_scalar(bytes).is_ok()
    })
}

fn blinding() -> impl Strategy<Value = [u8; 32]> {
    secret_key()
}

fn amount() -> impl Strategy<Value = U256> {
    any::<u128>().prop_map(U256::from)
}

fn leaves(max: usize) -> impl Strategy<Value = Vec<[u8; 32]>> {
    prop::collection::vec(prop::array::uniform32(any::<u8>()), 1..max)
}

/// Root computed level by level over the whole leaf row, padding with zero
/// hashes, independent of the incremental insert path.
fn batch_root(levels: usize, leaves: &[[u8; 32]]) -> [u8; 32] {
    let zeros = compute_zeros(levels);
    let mut row = leaves.to_vec();
    for zero in zeros.iter().take(levels) {
        if row.is_empty() {
            return zeros[levels];
        }
        if row.len() % 2 == 1 {
            row.push(*zero);
        }
        row = row.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
    }
    row.first().copied().unwrap_or(zeros[levels])
}

fn public_key(secret: &[u8; 32]) -> [u8; 33] {
    curve::public_key_from_scalar(&curve::parse_secret_scalar(secret).unwrap()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_commitment_opens_and_binds(
        value in amount(),
        r in blinding(),
        bit in 0usize..128,
        byte in 0usize..32,
    ) {
        let commitment = recompute_commitment(value, &r).unwrap();
        prop_assert!(verify_commitment(&commitment, value, &r));

        let flipped_amount = value ^ (U256::from(1u8) << bit);
        prop_assert!(!verify_commitment(&commitment, flipped_amount, &r));

        let mut flipped_blinding = r;
        flipped_blinding[byte] ^= 0x01;
        prop_assert!(!verify_commitment(&commitment, value, &flipped_blinding));
    }

    #[test]
    fn prop_balanced_commitments_verify(
        outputs in prop::collection::vec(any::<u64>().prop_map(U256::from), 1..5),
        which in any::<prop::sample::Index>(),
    ) {
        let input: U256 = outputs.iter().fold(U256::ZERO, |acc, a| acc + *a);
        let balanced = create_balanced_commitments(input, &outputs).unwrap();

        let points = |cs: &[shielded_wallet_lib::Commitment]| cs.iter().map(|c| c.commitment).collect::<Vec<_>>();
        prop_assert!(verify_balance(&points(&balanced.inputs), &points(&balanced.outputs)));

        let openings = |cs: &[shielded_wallet_lib::Commitment]| {
            cs.iter().map(|c| Opening { amount: c.amount, blinding: c.blinding }).collect::<Vec<_>>()
        };
        let ins = openings(&balanced.inputs);
        let mut outs = openings(&balanced.outputs);
        prop_assert!(verify_balance_with_amounts(&ins, &outs));

        let i = which.index(outs.len());
        outs[i].amount += U256::from(1u8);
        prop_assert!(!verify_balance_with_amounts(&ins, &outs));
    }

    #[test]
    fn prop_stealth_roundtrip(
        view in secret_key(),
        spend in secret_key(),
        ephemeral in secret_key(),
    ) {
        let view_pub = public_key(&view);
        let spend_pub = public_key(&spend);
        let (stealth, stealth_pub) =
            generate_stealth_address_with_ephemeral(&ephemeral, &view_pub, &spend_pub).unwrap();

        prop_assert!(check_ownership(&stealth, &view, &spend_pub));
        prop_assert_eq!(public_key_to_address(&stealth_pub), stealth.address);

        let recovered = compute_stealth_private_key(&stealth.ephemeral_public_key, &view, &spend).unwrap();
        let recovered_pub = curve::encode_uncompressed(
            &curve::parse_point(&public_key(&recovered)).unwrap()
        ).unwrap();
        prop_assert_eq!(recovered_pub, stealth_pub);
    }

    #[test]
    fn prop_stealth_rejects_strangers(
        view in secret_key(),
        spend in secret_key(),
        other_view in secret_key(),
        other_spend in secret_key(),
        ephemeral in secret_key(),
    ) {
        prop_assume!(view != other_view && spend != other_spend);
        let (stealth, _) =
            generate_stealth_address_with_ephemeral(&ephemeral, &public_key(&view), &public_key(&spend)).unwrap();

        prop_assert!(!check_ownership(&stealth, &other_view, &public_key(&spend)));
        prop_assert!(!check_ownership(&stealth, &view, &public_key(&other_spend)));
        prop_assert!(!check_ownership(&stealth, &other_view, &public_key(&other_spend)));
        // garbage never panics
        prop_assert!(!check_ownership(&stealth, &[0u8; 32], &[0x05; 33]));
    }

    #[test]
    fn prop_incremental_matches_batch(leaves in leaves(20)) {
        let mut tree = MerkleTree::new(LEVELS);
        for (i, leaf) in leaves.iter().enumerate() {
            let root = tree.insert_leaf(*leaf).unwrap();
            prop_assert_eq!(root, batch_root(LEVELS, &leaves[..=i]));
            let proof = tree.generate_proof(i as u64).unwrap();
            prop_assert!(proof.verify(&root));
        }
        for i in 0..leaves.len() as u64 {
            prop_assert!(tree.generate_proof(i).unwrap().verify(&tree.root()));
        }
    }

    #[test]
    fn prop_tampered_proof_fails(
        leaves in leaves(12),
        pick in any::<prop::sample::Index>(),
        level in 0usize..LEVELS,
        flip_index in any::<bool>(),
    ) {
        let tree = MerkleTree::create_from_commitments(LEVELS, &leaves).unwrap();
        let root = tree.root();
        let mut proof = tree.generate_proof(pick.index(leaves.len()) as u64).unwrap();

        if flip_index {
            proof.path_indices[level] ^= 1;
        } else {
            proof.path_elements[level][0] ^= 0x80;
        }
        prop_assert!(!proof.verify(&root));
    }

    #[test]
    fn prop_snapshot_restores_tree(leaves in leaves(16)) {
        let tree = MerkleTree::create_from_commitments(LEVELS, &leaves).unwrap();
        let json = serde_json::to_string(&tree.serialize()).unwrap();
        let restored = MerkleTree::deserialize(&serde_json::from_str(&json).unwrap()).unwrap();

        prop_assert_eq!(restored.root(), tree.root());
        prop_assert_eq!(restored.next_leaf_index(), tree.next_leaf_index());
        for i in 0..leaves.len() as u64 {
            prop_assert_eq!(restored.generate_proof(i).unwrap(), tree.generate_proof(i).unwrap());
        }
    }
}
