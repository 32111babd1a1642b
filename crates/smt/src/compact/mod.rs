//! Prefix-compressed Sparse Merkle Tree
//!
//! Leaves are `[LEAF_PREFIX, path, value_hash]`, internal nodes `[NODE_PREFIX, left, right]`, and
//! an empty subtree at any depth hashes to [`PLACEHOLDER`](crate::PLACEHOLDER). Because a leaf
//! record commits to its own path, proofs stop at the first leaf or empty subtree on the way down.

mod proof;
mod tree;

pub use proof::{
    compact_csmt_proof, decompact_csmt_proof, verify_csmt_compact_proof, verify_csmt_proof,
    verify_csmt_proof_with_updates, CsmtCompactProof, CsmtProof,
};
pub use tree::CompactSparseMerkleTree;
