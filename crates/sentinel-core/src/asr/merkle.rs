//! Merkle tree construction over record signatures.
//!
//! Leaves are the 32-byte record signatures in insertion order. Internal
//! nodes are `SHA-256(left || right)`; a level with an odd node count
//! duplicates its final node (Bitcoin-style). Proofs carry the sibling
//! hash and its side at each level and verify by recomputing the root.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha256, sha256_concat, Hash};

/// Which side of the running hash a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofPosition {
    /// Sibling is concatenated on the left.
    Left,
    /// Sibling is concatenated on the right.
    Right,
}

/// One level of a Merkle inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    /// Sibling hash, hex encoded.
    pub hash: String,
    /// Side the sibling joins from.
    pub position: ProofPosition,
}

/// A Merkle inclusion proof for a single leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the proven leaf in the batch.
    pub leaf_index: usize,
    /// Sibling path from leaf to root.
    pub path: Vec<ProofNode>,
}

/// Computes the Merkle root of `leaves`.
///
/// An empty batch hashes to `SHA-256("")` so the root is always
/// defined.
#[must_use]
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return sha256(b"");
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("level is non-empty"));
        }
        level = level
            .chunks_exact(2)
            .map(|pair| sha256_concat(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

/// Builds the inclusion proof for `leaves[index]`.
///
/// Returns `None` if `index` is out of bounds.
#[must_use]
pub fn merkle_proof(leaves: &[Hash], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }

    let mut path = Vec::new();
    let mut level = leaves.to_vec();
    let mut position = index;

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("level is non-empty"));
        }

        let sibling = position ^ 1;
        path.push(ProofNode {
            hash: hex::encode(level[sibling]),
            position: if position % 2 == 0 {
                ProofPosition::Right
            } else {
                ProofPosition::Left
            },
        });

        level = level
            .chunks_exact(2)
            .map(|pair| sha256_concat(&pair[0], &pair[1]))
            .collect();
        position /= 2;
    }

    Some(MerkleProof {
        leaf_index: index,
        path,
    })
}

/// Verifies that `leaf` belongs to the tree committed by `root`.
#[must_use]
pub fn verify_proof(leaf: &Hash, proof: &MerkleProof, root: &Hash) -> bool {
    let mut current = *leaf;
    for node in &proof.path {
        let Ok(sibling_bytes) = hex::decode(&node.hash) else {
            return false;
        };
        let Ok(sibling) = Hash::try_from(sibling_bytes.as_slice()) else {
            return false;
        };
        current = match node.position {
            ProofPosition::Right => sha256_concat(&current, &sibling),
            ProofPosition::Left => sha256_concat(&sibling, &current),
        };
    }
    current == *root
}
