//! Authenticated key-value storage over Sparse Merkle Trees
//!
//! A family of Sparse Merkle Trees committing a large, mostly-empty key space to a single field
//! element root, with membership and non-membership proofs:
//!
//! * [`SparseMerkleTree`]: fixed-height tree, keys hashed to paths.
//! * [`NumIndexSparseMerkleTree`]: fixed-height tree addressed by raw integer index.
//! * [`CompactSparseMerkleTree`]: prefix-compressed tree that only stores nodes at divergence points.
//! * [`DeepSparseMerkleSubTree`]: in-memory partial tree rebuilt from proofs, able to apply and
//!   re-prove updates on the imported paths.
//!
//! Persistence is abstracted behind the [`Store`] trait. [`MemoryStore`] is the bundled backend.

mod config;
mod crypto;
mod deep_subtree;
mod defaults;
mod nodestore;
mod numindex;
mod proof;
mod smt;
mod storage;
mod types;

pub mod compact;

pub use config::{TreeConfig, MAX_HEIGHT};
pub use crypto::{
    Blake3Hasher, FieldHasher, TreeHasher, EMPTY, EMPTY_PREFIX, LEAF_PREFIX, NODE_PREFIX, PLACEHOLDER,
};
pub use deep_subtree::{DeepSparseMerkleSubTree, NumIndexDeepSubTree};
pub use defaults::DefaultNodeCache;
pub use nodestore::MemoryStore;
pub use numindex::NumIndexSparseMerkleTree;
pub use proof::{
    compact_num_index_proof, compact_proof, compute_root, decompact_num_index_proof, decompact_proof,
    verify_compact_num_index_proof, verify_compact_proof, verify_num_index_proof, verify_proof, BitMask,
    CompactNumIndexProof, CompactProof, NumIndexProof, SparseMerkleProof,
};
pub use smt::SparseMerkleTree;
pub use storage::{Batch, Store, StoreOp};
pub use types::{Field, ToFields, FIELD_BITS, FIELD_BYTES};

pub use compact::{CompactSparseMerkleTree, CsmtCompactProof, CsmtProof};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmtError {
    #[error("Tree height {height} is outside [1, {max}]")]
    InvalidHeight { height: usize, max: usize },

    #[error("Index {index} does not fit in a tree of height {height}")]
    IndexOutOfRange { index: Field, height: usize },

    #[error("Value encodes to {len} field elements, an unhashed value must be exactly one")]
    ValueTooWide { len: usize },

    #[error("Key encodes to {len} field elements, an unhashed key must be exactly one")]
    KeyTooWide { len: usize },

    #[error("Proof has {actual} side nodes, expected {expected}")]
    ProofLength { expected: usize, actual: usize },

    #[error("Invalid compact proof: {0}")]
    InvalidCompactProof(String),

    #[error("Field element exceeds {FIELD_BITS} bits")]
    FieldOverflow,

    #[error("Node {0} not found in store")]
    NodeNotFound(Field),

    #[error("Value at path {0} not found in store")]
    ValueNotFound(Field),

    #[error("Store has no root")]
    RootNotFound,

    #[error("Malformed node record under {0}")]
    MalformedNode(Field),

    #[error("Path {0} was never imported into the subtree")]
    BranchNotImported(Field),

    #[error("Invalid proof")]
    InvalidProof,

    #[error("Key is already empty")]
    KeyAlreadyEmpty,

    #[error("Storage error: {0}")]
    Store(String),

    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, SmtError>;
