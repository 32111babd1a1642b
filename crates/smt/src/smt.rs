//! Fixed-height Sparse Merkle Tree over a [`Store`]

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::check_height;
use crate::crypto::{Blake3Hasher, FieldHasher, TreeHasher, EMPTY};
use crate::proof::{self, fold_path, CompactProof, SparseMerkleProof};
use crate::storage::{Batch, Store};
use crate::{Field, Result, SmtError, ToFields, TreeConfig};

/// Nodes met walking from a root down to one leaf
pub(crate) struct PathWalk {
    /// Siblings, root level first
    pub(crate) side_nodes: Vec<Field>,
    /// On-path nodes from the root down to the leaf, both included
    pub(crate) path_nodes: Vec<Field>,
    /// Leaf commitment found at the end of the path
    pub(crate) leaf: Field,
}

/// Path-addressed engine shared by the keyed and the numeric-indexed trees.
///
/// Every level of the tree has a stored node, empty subtrees resolving to the default-node chain
/// written at build time, so a walk never special-cases absent branches.
pub(crate) struct TreeCore<V, S, H> {
    store: S,
    hasher: Arc<TreeHasher<H>>,
    height: usize,
    hash_value: bool,
    defaults: Arc<[Field]>,
    root: Field,
    _value: PhantomData<fn() -> V>,
}

impl<V, S, H> TreeCore<V, S, H>
where
    V: ToFields + Clone + Send + Sync + 'static,
    S: Store<V>,
    H: FieldHasher,
{
    pub(crate) async fn build(store: S, hasher: Arc<TreeHasher<H>>, height: usize, hash_value: bool) -> Result<Self> {
        check_height(height)?;
        let defaults = hasher.default_nodes(height);

        let mut batch = store.begin();
        for level in 0..height {
            let child = defaults[level + 1];
            batch.prepare_put_nodes(defaults[level], vec![child, child]);
        }
        let root = defaults[0];
        batch.prepare_update_root(root);
        store.commit(batch).await?;
        debug!(height, %root, "built empty sparse merkle tree");

        Ok(Self {
            store,
            hasher,
            height,
            hash_value,
            defaults,
            root,
            _value: PhantomData,
        })
    }

    pub(crate) async fn import(store: S, hasher: Arc<TreeHasher<H>>, height: usize, hash_value: bool) -> Result<Self> {
        check_height(height)?;
        let defaults = hasher.default_nodes(height);
        let root = store.get_root().await?;
        debug!(height, %root, "imported sparse merkle tree");

        Ok(Self {
            store,
            hasher,
            height,
            hash_value,
            defaults,
            root,
            _value: PhantomData,
        })
    }

    pub(crate) fn root(&self) -> Field {
        self.root
    }

    pub(crate) fn height(&self) -> usize {
        self.height
    }

    pub(crate) fn hash_value(&self) -> bool {
        self.hash_value
    }

    pub(crate) fn hasher(&self) -> &Arc<TreeHasher<H>> {
        &self.hasher
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn empty_root(&self) -> Field {
        self.defaults[0]
    }

    pub(crate) fn leaf_hash(&self, value: Option<&V>) -> Result<Field> {
        self.hasher.leaf_hash(value, self.hash_value)
    }

    async fn read_nodes(&self, batch: Option<&Batch<V>>, key: &Field) -> Result<Vec<Field>> {
        if let Some(staged) = batch.and_then(|batch| batch.staged_nodes(key)) {
            return Ok(staged.to_vec());
        }
        self.store.get_nodes(key).await
    }

    /// Walk `height` levels down from `root` along `path`
    pub(crate) async fn walk(&self, batch: Option<&Batch<V>>, path: Field, root: Field) -> Result<PathWalk> {
        let mut side_nodes = Vec::with_capacity(self.height);
        let mut path_nodes = Vec::with_capacity(self.height + 1);
        path_nodes.push(root);

        let mut node_hash = root;
        for level in 0..self.height {
            let children = self.read_nodes(batch, &node_hash).await?;
            let &[left, right] = children.as_slice() else {
                return Err(SmtError::MalformedNode(node_hash));
            };
            let (side_node, next) = if path.bit_from_msb(level, self.height) {
                (left, right)
            } else {
                (right, left)
            };
            side_nodes.push(side_node);
            path_nodes.push(next);
            node_hash = next;
        }

        Ok(PathWalk {
            side_nodes,
            path_nodes,
            leaf: node_hash,
        })
    }

    /// Stage the writes that set the leaf at `path` to `new_leaf`, returning the resulting root.
    ///
    /// Stages nothing and returns `root` when the leaf already holds `new_leaf`.
    async fn update_for_root(
        &self,
        batch: &mut Batch<V>,
        root: Field,
        path: Field,
        new_leaf: Field,
        value: Option<V>,
    ) -> Result<Field> {
        let walk = self.walk(Some(&*batch), path, root).await?;
        if walk.leaf == new_leaf {
            return Ok(root);
        }

        // Every position on the path changes: release the old records, reference the new ones.
        // Default nodes are pinned by `build` and never counted.
        for (level, node) in walk.path_nodes.iter().enumerate() {
            if *node != self.defaults[level] {
                batch.prepare_del_nodes(*node);
            }
        }

        match value {
            Some(value) if new_leaf != EMPTY => {
                batch.prepare_put_nodes(new_leaf, vec![new_leaf]);
                batch.prepare_put_value(path, value);
            }
            _ => batch.prepare_del_value(path),
        }

        let defaults = &self.defaults;
        let new_root = fold_path(&self.hasher, path, &walk.side_nodes, new_leaf, |level, hash, children| {
            if hash != defaults[level] {
                batch.prepare_put_nodes(hash, children);
            }
        });
        trace!(%path, old_leaf = %walk.leaf, %new_leaf, %new_root, "staged leaf update");
        Ok(new_root)
    }

    pub(crate) async fn update_path(&mut self, path: Field, value: Option<V>) -> Result<Field> {
        self.update_paths(vec![(path, value)]).await
    }

    /// Apply updates in order within one batch and commit once
    pub(crate) async fn update_paths(&mut self, updates: Vec<(Field, Option<V>)>) -> Result<Field> {
        let leaves = updates
            .iter()
            .map(|(_, value)| self.leaf_hash(value.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let mut batch = self.store.begin();
        let mut root = self.root;
        for ((path, value), leaf) in updates.into_iter().zip(leaves) {
            root = self.update_for_root(&mut batch, root, path, leaf, value).await?;
        }

        if batch.is_empty() {
            return Ok(self.root);
        }
        batch.prepare_update_root(root);
        let staged = batch.len();
        self.store.commit(batch).await?;
        debug!(%root, staged, "committed sparse merkle tree update");
        self.root = root;
        Ok(root)
    }

    /// Point the tree, and the store's root pointer, at another root
    pub(crate) async fn set_root(&mut self, root: Field) -> Result<()> {
        let mut batch = self.store.begin();
        batch.prepare_update_root(root);
        self.store.commit(batch).await?;
        debug!(%root, "moved sparse merkle tree root");
        self.root = root;
        Ok(())
    }

    pub(crate) async fn get_path(&self, path: Field) -> Result<Option<V>> {
        if self.root == self.empty_root() {
            return Ok(None);
        }
        match self.store.get_value(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(SmtError::ValueNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn has_path(&self, path: Field) -> Result<bool> {
        let walk = self.walk(None, path, self.root).await?;
        Ok(walk.leaf != EMPTY)
    }

    pub(crate) async fn side_nodes(&self, path: Field, root: Field) -> Result<Vec<Field>> {
        Ok(self.walk(None, path, root).await?.side_nodes)
    }
}

/// Sparse Merkle Tree whose leaves are addressed by the hash of a key.
///
/// Values are persisted in the store under their path; the tree commits `hash(value)` (or the
/// raw value with `hash_value` off) at the leaf.
///
/// Mutations take `&mut self`, so one tree instance has one writer at a time.
pub struct SparseMerkleTree<V, S, H = Blake3Hasher> {
    core: TreeCore<V, S, H>,
    config: TreeConfig,
}

impl<V, S, H> SparseMerkleTree<V, S, H>
where
    V: ToFields + Clone + Send + Sync + 'static,
    S: Store<V>,
    H: FieldHasher,
{
    /// Create an empty tree, writing the default-node chain into `store`
    pub async fn build(store: S, hasher: Arc<TreeHasher<H>>, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let core = TreeCore::build(store, hasher, config.height, config.hash_value).await?;
        Ok(Self { core, config })
    }

    /// Open a tree already present in `store`
    pub async fn import(store: S, hasher: Arc<TreeHasher<H>>, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let core = TreeCore::import(store, hasher, config.height, config.hash_value).await?;
        Ok(Self { core, config })
    }

    pub fn root(&self) -> Field {
        self.core.root()
    }

    pub fn height(&self) -> usize {
        self.core.height()
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn hasher(&self) -> &Arc<TreeHasher<H>> {
        self.core.hasher()
    }

    pub fn store(&self) -> &S {
        self.core.store()
    }

    pub fn is_empty(&self) -> bool {
        self.core.root() == self.core.empty_root()
    }

    pub fn empty_root(&self) -> Field {
        self.core.empty_root()
    }

    fn path<K: ToFields + ?Sized>(&self, key: &K) -> Result<Field> {
        self.core.hasher().key_path(key, &self.config)
    }

    /// Value committed under `key`, `None` when absent
    pub async fn get<K: ToFields + ?Sized>(&self, key: &K) -> Result<Option<V>> {
        let path = self.path(key)?;
        self.core.get_path(path).await
    }

    pub async fn has<K: ToFields + ?Sized>(&self, key: &K) -> Result<bool> {
        let path = self.path(key)?;
        self.core.has_path(path).await
    }

    /// Set `key` to `value`, or delete it when `value` is `None`, returning the new root
    pub async fn update<K: ToFields + ?Sized>(&mut self, key: &K, value: Option<V>) -> Result<Field> {
        let path = self.path(key)?;
        self.core.update_path(path, value).await
    }

    /// Apply several updates in order with a single commit
    pub async fn update_all<K, I>(&mut self, updates: I) -> Result<Field>
    where
        K: ToFields,
        I: IntoIterator<Item = (K, Option<V>)>,
    {
        let updates = updates
            .into_iter()
            .map(|(key, value)| Ok((self.path(&key)?, value)))
            .collect::<Result<Vec<_>>>()?;
        self.core.update_paths(updates).await
    }

    pub async fn delete<K: ToFields + ?Sized>(&mut self, key: &K) -> Result<Field> {
        self.update(key, None).await
    }

    pub async fn set_root(&mut self, root: Field) -> Result<()> {
        self.core.set_root(root).await
    }

    pub async fn prove<K: ToFields + ?Sized>(&self, key: &K) -> Result<SparseMerkleProof> {
        self.prove_for_root(key, self.root()).await
    }

    /// Proof against an earlier root whose nodes are still in the store
    pub async fn prove_for_root<K: ToFields + ?Sized>(&self, key: &K, root: Field) -> Result<SparseMerkleProof> {
        let path = self.path(key)?;
        let side_nodes = self.core.side_nodes(path, root).await?;
        Ok(SparseMerkleProof { root, side_nodes })
    }

    pub async fn prove_compact<K: ToFields + ?Sized>(&self, key: &K) -> Result<CompactProof> {
        let proof = self.prove(key).await?;
        proof::compact_proof(self.core.hasher(), &proof)
    }

    /// Check `proof` against the current root with this tree's hashing policy
    pub fn verify<K: ToFields + ?Sized>(&self, proof: &SparseMerkleProof, key: &K, value: Option<&V>) -> bool {
        proof::verify_proof(self.core.hasher(), &self.config, proof, self.root(), key, value)
    }

    pub fn verify_compact<K: ToFields + ?Sized>(&self, proof: &CompactProof, key: &K, value: Option<&V>) -> bool {
        proof::verify_compact_proof(self.core.hasher(), &self.config, proof, self.root(), key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    type Tree = SparseMerkleTree<u64, MemoryStore<u64>>;

    async fn build(height: usize) -> Tree {
        let hasher = TreeHasher::shared(Blake3Hasher::default());
        Tree::build(MemoryStore::new(), hasher, TreeConfig::new(height)).await.unwrap()
    }

    #[tokio::test]
    async fn build_writes_default_chain() {
        let tree = build(8).await;
        assert!(tree.is_empty());
        assert_eq!(tree.root(), tree.hasher().default_nodes(8)[0]);
        assert_eq!(tree.store().node_count().unwrap(), 8);
        assert_eq!(tree.store().get_root().await.unwrap(), tree.root());
    }

    #[tokio::test]
    async fn build_rejects_bad_height() {
        let hasher = TreeHasher::shared(Blake3Hasher::default());
        let result = Tree::build(MemoryStore::new(), hasher, TreeConfig::new(255)).await;
        assert!(matches!(result, Err(SmtError::InvalidHeight { height: 255, .. })));
    }

    #[tokio::test]
    async fn update_get_prove() {
        let mut tree = build(16).await;
        let root = tree.update("alice", Some(10)).await.unwrap();
        assert_ne!(root, tree.empty_root());
        assert_eq!(tree.get("alice").await.unwrap(), Some(10));
        assert!(tree.has("alice").await.unwrap());
        assert!(!tree.has("bob").await.unwrap());
        assert_eq!(tree.get("bob").await.unwrap(), None);

        let proof = tree.prove("alice").await.unwrap();
        assert!(tree.verify(&proof, "alice", Some(&10)));
        assert!(!tree.verify(&proof, "alice", Some(&11)));
        assert!(!tree.verify(&proof, "alice", None));
    }

    #[tokio::test]
    async fn same_value_stages_nothing() {
        let mut tree = build(8).await;
        let root = tree.update(&1u64, Some(5)).await.unwrap();
        let nodes = tree.store().node_count().unwrap();
        assert_eq!(tree.update(&1u64, Some(5)).await.unwrap(), root);
        assert_eq!(tree.store().node_count().unwrap(), nodes);
    }

    #[tokio::test]
    async fn superseded_roots_are_pruned() {
        let mut tree = build(16).await;
        tree.update(&1u64, Some(1)).await.unwrap();
        let r1 = tree.update(&2u64, Some(2)).await.unwrap();
        let proof = tree.prove_for_root(&1u64, r1).await.unwrap();
        assert_eq!(proof.root, r1);

        let r2 = tree.update(&3u64, Some(3)).await.unwrap();
        assert!(matches!(
            tree.prove_for_root(&1u64, r1).await,
            Err(SmtError::NodeNotFound(_))
        ));
        let proof = tree.prove_for_root(&1u64, r2).await.unwrap();
        assert!(proof::verify_proof(tree.hasher(), tree.config(), &proof, r2, &1u64, Some(&1u64)));
    }

    #[tokio::test]
    async fn repeated_values_keep_shared_records() {
        let mut tree = build(254).await;
        for key in 0u64..40 {
            tree.update(&key, Some(100)).await.unwrap();
        }
        let leaf = tree.core.leaf_hash(Some(&100)).unwrap();
        assert_eq!(tree.store().node_refs(&leaf).unwrap(), 40);

        for key in 0u64..20 {
            tree.update(&key, Some(200)).await.unwrap();
        }
        assert_eq!(tree.store().node_refs(&leaf).unwrap(), 20);
        for key in 0u64..40 {
            let expected = if key < 20 { 200 } else { 100 };
            let proof = tree.prove(&key).await.unwrap();
            assert!(tree.verify(&proof, &key, Some(&expected)));
        }
    }

    #[tokio::test]
    async fn deleting_everything_releases_every_record() {
        let mut tree = build(8).await;
        let built = tree.store().node_count().unwrap();
        let keys: Vec<u64> = (0..24).collect();
        for key in &keys {
            tree.update(key, Some(key % 3)).await.unwrap();
        }
        for key in keys.iter().rev() {
            tree.update(key, Some(7)).await.unwrap();
        }
        for key in &keys {
            tree.delete(key).await.unwrap();
        }
        assert!(tree.is_empty());
        assert_eq!(tree.store().node_count().unwrap(), built);
        assert_eq!(tree.store().value_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn keys_beyond_height_are_rejected() {
        let hasher = TreeHasher::shared(Blake3Hasher::default());
        let config = TreeConfig::new(8).with_hash_key(false);
        let mut tree = Tree::build(MemoryStore::new(), hasher, config).await.unwrap();
        let root = tree.update(&1u64, Some(10)).await.unwrap();

        let result = tree.update(&257u64, Some(20)).await;
        assert!(matches!(result, Err(SmtError::IndexOutOfRange { height: 8, .. })));
        assert_eq!(tree.root(), root);
        assert!(tree.prove(&257u64).await.is_err());

        let proof = tree.prove(&1u64).await.unwrap();
        assert!(tree.verify(&proof, &1u64, Some(&10)));
        assert!(!tree.verify(&proof, &257u64, Some(&10)));
    }

    #[tokio::test]
    async fn set_root_moves_pointer() {
        let mut tree = build(8).await;
        let empty = tree.root();
        tree.update(&4u64, Some(4)).await.unwrap();
        tree.set_root(empty).await.unwrap();
        assert_eq!(tree.root(), empty);
        assert_eq!(tree.store().get_root().await.unwrap(), empty);
    }
}
