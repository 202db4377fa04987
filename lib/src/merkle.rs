//! Client-side mirror of the pool's incremental Merkle tree.
//!
//! Nodes live in a sparse map keyed by (level, index); any position never
//! written reads as that level's zero hash:
//!   zeros[0] = keccak256(abi.encodePacked(uint256(0)))
//!   zeros[i] = keccak256(zeros[i-1] || zeros[i-1])
//! An insertion writes the leaf plus exactly one node per level along its
//! path, so the root is maintained incrementally and never rebuilt.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::encoding::{decode_hex_fixed, encode_hex, hex_vec};
use crate::error::CryptoError;
use crate::{hash_pair, keccak256};

/// Depth of the deployed accumulator.
pub const TREE_DEPTH: usize = 32;

/// Leaf indices are `u64`, so the capacity `2^depth` must fit.
pub const MAX_TREE_DEPTH: usize = 63;

/// Zero hashes for levels `0..=levels`. `zeros[levels]` is the empty root.
pub fn compute_zeros(levels: usize) -> Vec<[u8; 32]> {
    let mut zeros = Vec::with_capacity(levels + 1);
    zeros.push(keccak256(&[0u8; 32]));
    for i in 1..=levels {
        zeros.push(hash_pair(&zeros[i - 1], &zeros[i - 1]));
    }
    zeros
}

/// Inclusion proof in the shape the prover service expects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    #[serde(with = "crate::encoding::fixed_hex")]
    pub leaf: [u8; 32],
    /// Sibling at each level, leaf level first.
    #[serde(with = "hex_vec")]
    pub path_elements: Vec<[u8; 32]>,
    /// 0 when the running node is the left child, 1 when it is the right.
    pub path_indices: Vec<u8>,
}

impl MerkleProof {
    pub fn verify(&self, root: &[u8; 32]) -> bool {
        verify_proof(&self.leaf, &self.path_elements, &self.path_indices, root)
    }
}

/// Fold a path bottom-up and compare with `root`. Mismatched path lengths
/// never verify.
pub fn verify_proof(leaf: &[u8; 32], path_elements: &[[u8; 32]], path_indices: &[u8], root: &[u8; 32]) -> bool {
    if path_elements.len() != path_indices.len() {
        return false;
    }
    let computed = path_elements
        .iter()
        .zip(path_indices)
        .fold(*leaf, |current, (sibling, &index)| match index {
            0 => hash_pair(&current, sibling),
            _ => hash_pair(sibling, &current),
        });
    computed == *root
}

/// Persisted form: sparse nodes as `"level-index" -> hex`, counters as-is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    #[serde(default = "default_levels")]
    pub levels: usize,
    pub nodes: Vec<(String, String)>,
    pub next_leaf_index: u64,
    pub root: String,
}

fn default_levels() -> usize {
    TREE_DEPTH
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: usize,
    zeros: Vec<[u8; 32]>,
    nodes: HashMap<(usize, u64), [u8; 32]>,
    next_leaf_index: u64,
    root: [u8; 32],
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new(TREE_DEPTH)
    }
}

impl PartialEq for MerkleTree {
    fn eq(&self, other: &Self) -> bool {
        self.levels == other.levels
            && self.next_leaf_index == other.next_leaf_index
            && self.root == other.root
            && self.nodes == other.nodes
    }
}

impl Eq for MerkleTree {}

impl MerkleTree {
    /// An empty tree of the given depth.
    ///
    /// # Panics
    ///
    /// If `levels` is outside `1..=MAX_TREE_DEPTH`. Use [`MerkleTree::try_new`]
    /// for depths that come from configuration.
    pub fn new(levels: usize) -> Self {
        match Self::try_new(levels) {
            Ok(tree) => tree,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn try_new(levels: usize) -> Result<Self, CryptoError> {
        if !(1..=MAX_TREE_DEPTH).contains(&levels) {
            return Err(CryptoError::UnsupportedDepth(levels));
        }
        let zeros = compute_zeros(levels);
        let root = zeros[levels];
        Ok(MerkleTree {
            levels,
            zeros,
            nodes: HashMap::new(),
            next_leaf_index: 0,
            root,
        })
    }

    /// Build a tree by inserting `commitments` in order.
    pub fn create_from_commitments(levels: usize, commitments: &[[u8; 32]]) -> Result<Self, CryptoError> {
        let mut tree = Self::new(levels);
        for leaf in commitments {
            tree.insert_leaf(*leaf)?;
        }
        Ok(tree)
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    pub fn next_leaf_index(&self) -> u64 {
        self.next_leaf_index
    }

    pub fn capacity(&self) -> u64 {
        1u64 << self.levels
    }

    pub fn zero_hash(&self, level: usize) -> Option<[u8; 32]> {
        self.zeros.get(level).copied()
    }

    fn node(&self, level: usize, index: u64) -> [u8; 32] {
        self.nodes
            .get(&(level, index))
            .copied()
            .unwrap_or(self.zeros[level])
    }

    /// Append a leaf and return the new root.
    pub fn insert_leaf(&mut self, leaf: [u8; 32]) -> Result<[u8; 32], CryptoError> {
        let index = self.next_leaf_index;
        if index >= self.capacity() {
            return Err(CryptoError::TreeFull {
                capacity: self.capacity(),
            });
        }

        self.nodes.insert((0, index), leaf);

        let mut current_index = index;
        let mut current_hash = leaf;
        for level in 0..self.levels {
            current_hash = if current_index % 2 == 0 {
                // Left child: sibling on the right is still empty or filled later
                hash_pair(&current_hash, &self.node(level, current_index + 1))
            } else {
                hash_pair(&self.node(level, current_index - 1), &current_hash)
            };
            current_index /= 2;
            self.nodes.insert((level + 1, current_index), current_hash);
        }

        self.root = current_hash;
        self.next_leaf_index = index + 1;
        Ok(self.root)
    }

    /// Inclusion proof for an inserted leaf, against the current root.
    pub fn generate_proof(&self, leaf_index: u64) -> Result<MerkleProof, CryptoError> {
        if leaf_index >= self.next_leaf_index {
            return Err(CryptoError::LeafIndexOutOfBounds {
                index: leaf_index,
                next: self.next_leaf_index,
            });
        }

        let mut path_elements = Vec::with_capacity(self.levels);
        let mut path_indices = Vec::with_capacity(self.levels);
        let mut current_index = leaf_index;
        for level in 0..self.levels {
            let is_left = current_index % 2 == 0;
            let sibling_index = if is_left { current_index + 1 } else { current_index - 1 };
            path_elements.push(self.node(level, sibling_index));
            path_indices.push(u8::from(!is_left));
            current_index /= 2;
        }

        Ok(MerkleProof {
            leaf: self.node(0, leaf_index),
            path_elements,
            path_indices,
        })
    }

    /// Same as [`verify_proof`]; kept on the tree for call-site symmetry.
    pub fn verify_proof(&self, leaf: &[u8; 32], path_elements: &[[u8; 32]], path_indices: &[u8], root: &[u8; 32]) -> bool {
        verify_proof(leaf, path_elements, path_indices, root)
    }

    /// All leaves in insertion order.
    pub fn leaves(&self) -> Vec<[u8; 32]> {
        (0..self.next_leaf_index).map(|i| self.node(0, i)).collect()
    }

    /// Linear scan for a leaf's position.
    pub fn find_leaf_index(&self, leaf: &[u8; 32]) -> Option<u64> {
        (0..self.next_leaf_index).find(|&i| self.node(0, i) == *leaf)
    }

    /// Append the suffix of `leaves` beyond what this tree already holds.
    /// `leaves` is the full on-chain leaf list, so repeated calls are no-ops.
    pub fn sync_with_leaves(&mut self, leaves: &[[u8; 32]]) -> Result<usize, CryptoError> {
        let start = usize::try_from(self.next_leaf_index).unwrap_or(usize::MAX);
        let mut appended = 0;
        for leaf in leaves.iter().skip(start) {
            self.insert_leaf(*leaf)?;
            appended += 1;
        }
        Ok(appended)
    }

    pub fn serialize(&self) -> TreeSnapshot {
        let mut nodes: Vec<(String, String)> = self
            .nodes
            .iter()
            .map(|(&(level, index), hash)| (format!("{level}-{index}"), encode_hex(hash)))
            .collect();
        nodes.sort();
        TreeSnapshot {
            levels: self.levels,
            nodes,
            next_leaf_index: self.next_leaf_index,
            root: encode_hex(&self.root),
        }
    }

    /// Restore a tree. The leaves are replayed into a fresh tree and every
    /// stored node and the stored root must match the replay.
    pub fn deserialize(snapshot: &TreeSnapshot) -> Result<Self, CryptoError> {
        let mut tree = Self::try_new(snapshot.levels).map_err(|e| malformed(e.to_string()))?;
        if snapshot.next_leaf_index > tree.capacity() {
            return Err(malformed("next leaf index beyond capacity"));
        }

        for (key, value) in &snapshot.nodes {
            let (level, index) = parse_node_key(key)?;
            if level > tree.levels || index >= (tree.capacity() >> level) {
                return Err(malformed(format!("node {key} outside tree")));
            }
            let hash = decode_hex_fixed::<32>(value).map_err(|e| malformed(e.to_string()))?;
            tree.nodes.insert((level, index), hash);
        }
        tree.next_leaf_index = snapshot.next_leaf_index;
        tree.root = decode_hex_fixed::<32>(&snapshot.root).map_err(|e| malformed(e.to_string()))?;

        if (0..tree.next_leaf_index).any(|i| !tree.nodes.contains_key(&(0, i))) {
            return Err(malformed("missing leaf"));
        }
        let rebuilt = Self::create_from_commitments(tree.levels, &tree.leaves())?;
        if rebuilt.root != tree.root {
            return Err(malformed("root does not match leaves"));
        }
        if rebuilt.nodes != tree.nodes {
            return Err(malformed("nodes do not match leaves"));
        }
        Ok(rebuilt)
    }
}

fn malformed(reason: impl Into<String>) -> CryptoError {
    CryptoError::MalformedTree(reason.into())
}

fn parse_node_key(key: &str) -> Result<(usize, u64), CryptoError> {
    let (level, index) = key
        .split_once('-')
        .ok_or_else(|| malformed(format!("node key {key}")))?;
    let level = level.parse().map_err(|_| malformed(format!("node key {key}")))?;
    let index = index.parse().map_err(|_| malformed(format!("node key {key}")))?;
    Ok((level, index))
}
