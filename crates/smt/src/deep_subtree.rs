//! Partial, in-memory trees rebuilt from proofs against a known root
//!
//! A deep subtree holds only the nodes on the paths of the proofs it was given. Updates and proofs
//! on those paths follow exactly the hashing law of the full tree, so applying the same updates to
//! the full tree and to the subtree yields the same root.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::config::check_height;
use crate::crypto::{Blake3Hasher, FieldHasher, TreeHasher, EMPTY};
use crate::proof::{fold_path, NumIndexProof, SparseMerkleProof};
use crate::{Field, Result, SmtError, ToFields, TreeConfig};

/// Node and leaf maps shared by the keyed and numeric-indexed subtrees
struct SubTreeCore<H> {
    node_store: HashMap<Field, Vec<Field>>,
    value_store: HashMap<Field, Field>,
    root: Field,
    height: usize,
    hasher: Arc<TreeHasher<H>>,
}

impl<H: FieldHasher> SubTreeCore<H> {
    fn new(root: Field, hasher: Arc<TreeHasher<H>>, height: usize) -> Result<Self> {
        check_height(height)?;
        Ok(Self {
            node_store: HashMap::new(),
            value_store: HashMap::new(),
            root,
            height,
            hasher,
        })
    }

    fn add_branch(&mut self, proof_root: Field, side_nodes: &[Field], path: Field, leaf: Field) -> Result<()> {
        if side_nodes.len() != self.height {
            return Err(SmtError::ProofLength {
                expected: self.height,
                actual: side_nodes.len(),
            });
        }
        if proof_root != self.root {
            return Err(SmtError::InvalidProof);
        }

        let mut records = Vec::with_capacity(self.height);
        let computed = fold_path(&self.hasher, path, side_nodes, leaf, |_, hash, children| {
            records.push((hash, children));
        });
        if computed != self.root {
            return Err(SmtError::InvalidProof);
        }

        self.node_store.extend(records);
        self.value_store.insert(path, leaf);
        trace!(%path, root = %self.root, "imported branch into deep subtree");
        Ok(())
    }

    fn side_nodes(&self, path: Field) -> Result<Vec<Field>> {
        if !self.value_store.contains_key(&path) {
            return Err(SmtError::BranchNotImported(path));
        }

        let mut side_nodes = Vec::with_capacity(self.height);
        let mut node_hash = self.root;
        for level in 0..self.height {
            let children = self
                .node_store
                .get(&node_hash)
                .ok_or(SmtError::BranchNotImported(path))?;
            let &[left, right] = children.as_slice() else {
                return Err(SmtError::MalformedNode(node_hash));
            };
            let (side_node, next) = if path.bit_from_msb(level, self.height) {
                (left, right)
            } else {
                (right, left)
            };
            side_nodes.push(side_node);
            node_hash = next;
        }
        Ok(side_nodes)
    }

    fn update(&mut self, path: Field, leaf: Field) -> Result<Field> {
        let side_nodes = self.side_nodes(path)?;
        let node_store = &mut self.node_store;
        let new_root = fold_path(&self.hasher, path, &side_nodes, leaf, |_, hash, children| {
            node_store.insert(hash, children);
        });
        self.value_store.insert(path, leaf);
        self.root = new_root;
        Ok(new_root)
    }

    fn has(&self, path: Field) -> Result<bool> {
        self.value_store
            .get(&path)
            .map(|leaf| *leaf != EMPTY)
            .ok_or(SmtError::BranchNotImported(path))
    }
}

/// Deep subtree of a keyed [`SparseMerkleTree`](crate::SparseMerkleTree)
pub struct DeepSparseMerkleSubTree<V, H = Blake3Hasher> {
    core: SubTreeCore<H>,
    config: TreeConfig,
    _value: PhantomData<fn(&V)>,
}

impl<V, H> DeepSparseMerkleSubTree<V, H>
where
    V: ToFields,
    H: FieldHasher,
{
    /// Empty subtree fixed to `root`; `config` must match the tree the proofs come from
    pub fn new(root: Field, hasher: Arc<TreeHasher<H>>, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: SubTreeCore::new(root, hasher, config.height)?,
            config,
            _value: PhantomData,
        })
    }

    pub fn root(&self) -> Field {
        self.core.root
    }

    pub fn height(&self) -> usize {
        self.core.height
    }

    fn path<K: ToFields + ?Sized>(&self, key: &K) -> Result<Field> {
        self.core.hasher.key_path(key, &self.config)
    }

    fn leaf_hash(&self, value: Option<&V>) -> Result<Field> {
        self.core.hasher.leaf_hash(value, self.config.hash_value)
    }

    /// Verify `proof` for `(key, value)` against the subtree root and import its path.
    ///
    /// Fails with [`SmtError::InvalidProof`] when it does not verify.
    pub fn add_branch<K: ToFields + ?Sized>(
        &mut self,
        proof: &SparseMerkleProof,
        key: &K,
        value: Option<&V>,
    ) -> Result<()> {
        let path = self.path(key)?;
        let leaf = self.leaf_hash(value)?;
        self.core.add_branch(proof.root, &proof.side_nodes, path, leaf)
    }

    /// Whether an imported key holds a value
    pub fn has<K: ToFields + ?Sized>(&self, key: &K) -> Result<bool> {
        let path = self.path(key)?;
        self.core.has(path)
    }

    /// Update an imported key, returning the new subtree root
    pub fn update<K: ToFields + ?Sized>(&mut self, key: &K, value: Option<&V>) -> Result<Field> {
        let path = self.path(key)?;
        let leaf = self.leaf_hash(value)?;
        self.core.update(path, leaf)
    }

    pub fn prove<K: ToFields + ?Sized>(&self, key: &K) -> Result<SparseMerkleProof> {
        let path = self.path(key)?;
        Ok(SparseMerkleProof {
            root: self.core.root,
            side_nodes: self.core.side_nodes(path)?,
        })
    }
}

/// Deep subtree of a [`NumIndexSparseMerkleTree`](crate::NumIndexSparseMerkleTree)
pub struct NumIndexDeepSubTree<V, H = Blake3Hasher> {
    core: SubTreeCore<H>,
    hash_value: bool,
    _value: PhantomData<fn(&V)>,
}

impl<V, H> NumIndexDeepSubTree<V, H>
where
    V: ToFields,
    H: FieldHasher,
{
    pub fn new(root: Field, hasher: Arc<TreeHasher<H>>, height: usize, hash_value: bool) -> Result<Self> {
        Ok(Self {
            core: SubTreeCore::new(root, hasher, height)?,
            hash_value,
            _value: PhantomData,
        })
    }

    pub fn root(&self) -> Field {
        self.core.root
    }

    pub fn height(&self) -> usize {
        self.core.height
    }

    fn path(&self, index: impl Into<Field>) -> Result<Field> {
        let index = index.into();
        if !index.fits_in_bits(self.core.height) {
            return Err(SmtError::IndexOutOfRange {
                index,
                height: self.core.height,
            });
        }
        Ok(index)
    }

    fn leaf_hash(&self, value: Option<&V>) -> Result<Field> {
        self.core.hasher.leaf_hash(value, self.hash_value)
    }

    /// Import the path of `proof`, which names its own index
    pub fn add_branch(&mut self, proof: &NumIndexProof, value: Option<&V>) -> Result<()> {
        let path = self.path(proof.path)?;
        let leaf = self.leaf_hash(value)?;
        self.core.add_branch(proof.root, &proof.side_nodes, path, leaf)
    }

    pub fn has(&self, index: impl Into<Field>) -> Result<bool> {
        let path = self.path(index)?;
        self.core.has(path)
    }

    pub fn update(&mut self, index: impl Into<Field>, value: Option<&V>) -> Result<Field> {
        let path = self.path(index)?;
        let leaf = self.leaf_hash(value)?;
        self.core.update(path, leaf)
    }

    pub fn prove(&self, index: impl Into<Field>) -> Result<NumIndexProof> {
        let path = self.path(index)?;
        Ok(NumIndexProof {
            root: self.core.root,
            path,
            side_nodes: self.core.side_nodes(path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::verify_num_index_proof;

    fn hasher() -> Arc<TreeHasher<Blake3Hasher>> {
        TreeHasher::shared(Blake3Hasher::default())
    }

    fn empty_proof(th: &TreeHasher<Blake3Hasher>, height: usize, index: u64) -> NumIndexProof {
        let defaults = th.default_nodes(height);
        NumIndexProof {
            root: defaults[0],
            path: Field::from_u64(index),
            side_nodes: defaults[1..].to_vec(),
        }
    }

    #[test]
    fn rejects_proof_for_another_root() {
        let th = hasher();
        let mut proof = empty_proof(&th, 4, 3);
        let mut subtree = NumIndexDeepSubTree::<u64, _>::new(proof.root, th.clone(), 4, true).unwrap();

        assert!(matches!(subtree.add_branch(&proof, Some(&1)), Err(SmtError::InvalidProof)));
        proof.side_nodes[0] = Field::from_u64(1);
        assert!(matches!(subtree.add_branch(&proof, None), Err(SmtError::InvalidProof)));
        proof.side_nodes.pop();
        assert!(matches!(
            subtree.add_branch(&proof, None),
            Err(SmtError::ProofLength { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn update_requires_imported_path() {
        let th = hasher();
        let proof = empty_proof(&th, 4, 3);
        let mut subtree = NumIndexDeepSubTree::<u64, _>::new(proof.root, th.clone(), 4, true).unwrap();
        subtree.add_branch(&proof, None).unwrap();
        assert!(!subtree.has(3u64).unwrap());

        assert!(matches!(subtree.update(5u64, Some(&1)), Err(SmtError::BranchNotImported(_))));
        assert!(matches!(subtree.prove(5u64), Err(SmtError::BranchNotImported(_))));

        let root = subtree.update(3u64, Some(&30)).unwrap();
        assert_ne!(root, proof.root);
        assert!(subtree.has(3u64).unwrap());

        let reproved = subtree.prove(3u64).unwrap();
        assert_eq!(reproved.root, root);
        assert!(verify_num_index_proof(&th, true, &reproved, root, Some(&30u64)));
    }

    #[test]
    fn keyed_subtree_uses_key_hash() {
        let th = hasher();
        let config = TreeConfig::new(8);
        let defaults = th.default_nodes(8);
        let proof = SparseMerkleProof {
            root: defaults[0],
            side_nodes: defaults[1..].to_vec(),
        };
        let mut subtree = DeepSparseMerkleSubTree::<u64, _>::new(defaults[0], th.clone(), config).unwrap();
        subtree.add_branch(&proof, "carol", None).unwrap();
        let root = subtree.update("carol", Some(&3)).unwrap();
        let proof = subtree.prove("carol").unwrap();
        assert!(crate::verify_proof(&th, &config, &proof, root, "carol", Some(&3u64)));
    }
}
