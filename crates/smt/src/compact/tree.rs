use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, trace};

use super::proof::{self, CsmtCompactProof, CsmtProof};
use crate::crypto::{Blake3Hasher, FieldHasher, TreeHasher, PLACEHOLDER};
use crate::storage::{Batch, Store};
use crate::{Field, Result, SmtError, ToFields, TreeConfig};

/// Nodes met walking from a root down to the leaf or empty subtree ending a path
struct CompactWalk {
    /// Siblings, deepest first
    side_nodes: Vec<Field>,
    /// On-path nodes, deepest first, the root last
    path_nodes: Vec<Field>,
    /// Leaf record ending the path, `None` for an empty subtree
    leaf_data: Option<Vec<Field>>,
    /// Record of the deepest sibling, when requested
    sibling_data: Option<Vec<Field>>,
}

/// Number of leading bits two `depth`-bit paths share
fn count_common_prefix(a: Field, b: Field, depth: usize) -> usize {
    (0..depth)
        .find(|&i| a.bit_from_msb(i, depth) != b.bit_from_msb(i, depth))
        .unwrap_or(depth)
}

/// Prefix-compressed Sparse Merkle Tree.
///
/// A leaf record `[LEAF_PREFIX, path, value_hash]` sits at the shallowest depth where its subtree
/// holds no other leaf, so a tree of `n` leaves stores `O(n)` internal nodes regardless of depth
/// and empty subtrees are the [`PLACEHOLDER`] hash rather than stored chains.
pub struct CompactSparseMerkleTree<V, S, H = Blake3Hasher> {
    store: S,
    hasher: Arc<TreeHasher<H>>,
    config: TreeConfig,
    root: Field,
    _value: PhantomData<fn() -> V>,
}

impl<V, S, H> CompactSparseMerkleTree<V, S, H>
where
    V: ToFields + Clone + Send + Sync + 'static,
    S: Store<V>,
    H: FieldHasher,
{
    /// Create an empty tree of depth `config.height`
    pub async fn build(store: S, hasher: Arc<TreeHasher<H>>, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let mut batch = store.begin();
        batch.prepare_update_root(PLACEHOLDER);
        store.commit(batch).await?;
        debug!(depth = config.height, "built empty compact sparse merkle tree");

        Ok(Self {
            store,
            hasher,
            config,
            root: PLACEHOLDER,
            _value: PhantomData,
        })
    }

    pub async fn import(store: S, hasher: Arc<TreeHasher<H>>, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let root = store.get_root().await?;
        debug!(depth = config.height, %root, "imported compact sparse merkle tree");

        Ok(Self {
            store,
            hasher,
            config,
            root,
            _value: PhantomData,
        })
    }

    pub fn root(&self) -> Field {
        self.root
    }

    pub fn depth(&self) -> usize {
        self.config.height
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn hasher(&self) -> &Arc<TreeHasher<H>> {
        &self.hasher
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_empty(&self) -> bool {
        self.root == PLACEHOLDER
    }

    fn path<K: ToFields + ?Sized>(&self, key: &K) -> Result<Field> {
        self.hasher.key_path(key, &self.config)
    }

    fn bit(&self, path: Field, i: usize) -> bool {
        path.bit_from_msb(i, self.config.height)
    }

    async fn read_nodes(&self, batch: Option<&Batch<V>>, key: &Field) -> Result<Vec<Field>> {
        if let Some(staged) = batch.and_then(|batch| batch.staged_nodes(key)) {
            return Ok(staged.to_vec());
        }
        self.store.get_nodes(key).await
    }

    async fn walk(
        &self,
        batch: Option<&Batch<V>>,
        path: Field,
        root: Field,
        with_sibling_data: bool,
    ) -> Result<CompactWalk> {
        let mut side_nodes = Vec::new();
        let mut path_nodes = vec![root];

        if root == PLACEHOLDER {
            return Ok(CompactWalk {
                side_nodes,
                path_nodes,
                leaf_data: None,
                sibling_data: None,
            });
        }

        let root_data = self.read_nodes(batch, &root).await?;
        if TreeHasher::<H>::is_leaf(&root_data) {
            return Ok(CompactWalk {
                side_nodes,
                path_nodes,
                leaf_data: Some(root_data),
                sibling_data: None,
            });
        }

        let mut node_hash = root;
        let mut current_data = root_data;
        let mut leaf_data = None;
        for level in 0..self.config.height {
            let (left, right) =
                TreeHasher::<H>::parse_node(&current_data).ok_or(SmtError::MalformedNode(node_hash))?;
            let (side_node, next) = if self.bit(path, level) {
                (left, right)
            } else {
                (right, left)
            };
            side_nodes.push(side_node);
            path_nodes.push(next);
            node_hash = next;

            if next == PLACEHOLDER {
                break;
            }
            current_data = self.read_nodes(batch, &next).await?;
            if TreeHasher::<H>::is_leaf(&current_data) {
                leaf_data = Some(current_data);
                break;
            }
        }

        let sibling_data = match side_nodes.last() {
            Some(sibling) if with_sibling_data && *sibling != PLACEHOLDER => {
                Some(self.read_nodes(batch, sibling).await?)
            }
            _ => None,
        };

        side_nodes.reverse();
        path_nodes.reverse();
        Ok(CompactWalk {
            side_nodes,
            path_nodes,
            leaf_data,
            sibling_data,
        })
    }

    /// Stage setting `path` to `value`; returns `root` untouched when the value is already there
    async fn update_for_root(
        &self,
        batch: &mut Batch<V>,
        root: Field,
        path: Field,
        value: V,
        value_hash: Field,
    ) -> Result<Field> {
        let depth = self.config.height;
        let walk = self.walk(Some(&*batch), path, root, false).await?;
        let deepest = walk.path_nodes[0];

        let (common_prefix, old_value_hash) = if deepest == PLACEHOLDER {
            (depth, None)
        } else {
            let leaf_data = walk.leaf_data.as_deref().ok_or(SmtError::MalformedNode(deepest))?;
            let (actual_path, old_value_hash) =
                TreeHasher::<H>::parse_leaf(leaf_data).ok_or(SmtError::MalformedNode(deepest))?;
            (count_common_prefix(path, actual_path, depth), Some(old_value_hash))
        };
        if common_prefix == depth && old_value_hash == Some(value_hash) {
            return Ok(root);
        }

        let (leaf_hash, leaf_data) = self.hasher.digest_leaf(path, value_hash);
        batch.prepare_put_nodes(leaf_hash, leaf_data);
        let mut current = leaf_hash;

        if common_prefix != depth {
            // Another leaf ends this path: hang both under a node at their first differing bit.
            let (hash, data) = if self.bit(path, common_prefix) {
                self.hasher.digest_compact_node(deepest, current)
            } else {
                self.hasher.digest_compact_node(current, deepest)
            };
            batch.prepare_put_nodes(hash, data);
            current = hash;
        } else if old_value_hash.is_some() {
            batch.prepare_del_nodes(deepest);
            batch.prepare_del_value(path);
        }

        for node in &walk.path_nodes[1..] {
            batch.prepare_del_nodes(*node);
        }

        let offset = depth - walk.side_nodes.len();
        for i in 0..depth {
            let side_node = if i < offset {
                // Below the stored side nodes, placeholders are only needed down to where the
                // two leaves diverge.
                if common_prefix != depth && common_prefix > depth - 1 - i {
                    PLACEHOLDER
                } else {
                    continue;
                }
            } else {
                walk.side_nodes[i - offset]
            };

            let (hash, data) = if self.bit(path, depth - 1 - i) {
                self.hasher.digest_compact_node(side_node, current)
            } else {
                self.hasher.digest_compact_node(current, side_node)
            };
            batch.prepare_put_nodes(hash, data);
            current = hash;
        }

        batch.prepare_put_value(path, value);
        trace!(%path, common_prefix, new_root = %current, "staged compact leaf update");
        Ok(current)
    }

    /// Stage removing `path`; fails with [`SmtError::KeyAlreadyEmpty`] if it holds nothing
    async fn delete_for_root(&self, batch: &mut Batch<V>, root: Field, path: Field) -> Result<Field> {
        let walk = self.walk(Some(&*batch), path, root, false).await?;
        let deepest = walk.path_nodes[0];
        if deepest == PLACEHOLDER {
            return Err(SmtError::KeyAlreadyEmpty);
        }
        let leaf_data = walk.leaf_data.as_deref().ok_or(SmtError::MalformedNode(deepest))?;
        let (actual_path, _) = TreeHasher::<H>::parse_leaf(leaf_data).ok_or(SmtError::MalformedNode(deepest))?;
        if actual_path != path {
            return Err(SmtError::KeyAlreadyEmpty);
        }

        for node in &walk.path_nodes {
            batch.prepare_del_nodes(*node);
        }
        batch.prepare_del_value(path);

        // Bubble a lone leaf sibling up past placeholder siblings until it meets a real one.
        let count = walk.side_nodes.len();
        let mut current: Option<Field> = None;
        let mut non_placeholder_reached = false;
        for (i, side_node) in walk.side_nodes.iter().enumerate() {
            let cur = match current {
                Some(cur) => cur,
                None if *side_node == PLACEHOLDER => continue,
                None => {
                    let side_data = self.read_nodes(Some(&*batch), side_node).await?;
                    if TreeHasher::<H>::is_leaf(&side_data) {
                        current = Some(*side_node);
                        continue;
                    }
                    non_placeholder_reached = true;
                    PLACEHOLDER
                }
            };

            if !non_placeholder_reached {
                if *side_node == PLACEHOLDER {
                    continue;
                }
                non_placeholder_reached = true;
            }

            let (hash, data) = if self.bit(path, count - 1 - i) {
                self.hasher.digest_compact_node(*side_node, cur)
            } else {
                self.hasher.digest_compact_node(cur, *side_node)
            };
            batch.prepare_put_nodes(hash, data);
            current = Some(hash);
        }

        let new_root = current.unwrap_or(PLACEHOLDER);
        trace!(%path, %new_root, "staged compact leaf deletion");
        Ok(new_root)
    }

    async fn apply(&self, batch: &mut Batch<V>, root: Field, path: Field, value: Option<(V, Field)>) -> Result<Field> {
        match value {
            Some((value, value_hash)) => self.update_for_root(batch, root, path, value, value_hash).await,
            None => match self.delete_for_root(batch, root, path).await {
                Err(SmtError::KeyAlreadyEmpty) => {
                    debug!(%path, "key already empty, nothing to delete");
                    Ok(root)
                }
                result => result,
            },
        }
    }

    async fn commit(&mut self, mut batch: Batch<V>, root: Field) -> Result<Field> {
        if root == self.root {
            return Ok(root);
        }
        batch.prepare_update_root(root);
        let staged = batch.len();
        self.store.commit(batch).await?;
        debug!(%root, staged, "committed compact sparse merkle tree update");
        self.root = root;
        Ok(root)
    }

    fn prepare_value(&self, value: Option<V>) -> Result<Option<(V, Field)>> {
        value
            .map(|value| {
                let value_hash = self.hasher.value_hash(&value, self.config.hash_value)?;
                Ok((value, value_hash))
            })
            .transpose()
    }

    pub async fn get<K: ToFields + ?Sized>(&self, key: &K) -> Result<Option<V>> {
        if self.root == PLACEHOLDER {
            return Ok(None);
        }
        let path = self.path(key)?;
        match self.store.get_value(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(SmtError::ValueNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn has<K: ToFields + ?Sized>(&self, key: &K) -> Result<bool> {
        let path = self.path(key)?;
        let walk = self.walk(None, path, self.root, false).await?;
        Ok(walk
            .leaf_data
            .as_deref()
            .and_then(TreeHasher::<H>::parse_leaf)
            .is_some_and(|(actual_path, _)| actual_path == path))
    }

    /// Set `key` to `value`, or delete it when `value` is `None`, returning the new root.
    ///
    /// Deleting an absent key leaves the root unchanged.
    pub async fn update<K: ToFields + ?Sized>(&mut self, key: &K, value: Option<V>) -> Result<Field> {
        let path = self.path(key)?;
        let value = self.prepare_value(value)?;
        let mut batch = self.store.begin();
        let root = self.apply(&mut batch, self.root, path, value).await?;
        self.commit(batch, root).await
    }

    pub async fn update_all<K, I>(&mut self, updates: I) -> Result<Field>
    where
        K: ToFields,
        I: IntoIterator<Item = (K, Option<V>)>,
    {
        let updates = updates
            .into_iter()
            .map(|(key, value)| Ok((self.path(&key)?, self.prepare_value(value)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut batch = self.store.begin();
        let mut root = self.root;
        for (path, value) in updates {
            root = self.apply(&mut batch, root, path, value).await?;
        }
        self.commit(batch, root).await
    }

    pub async fn delete<K: ToFields + ?Sized>(&mut self, key: &K) -> Result<Field> {
        self.update(key, None).await
    }

    async fn prove_inner<K: ToFields + ?Sized>(&self, key: &K, with_sibling_data: bool) -> Result<CsmtProof> {
        let path = self.path(key)?;
        let walk = self.walk(None, path, self.root, with_sibling_data).await?;

        let non_membership_leaf_data = walk.leaf_data.filter(|data| {
            TreeHasher::<H>::parse_leaf(data).is_some_and(|(actual_path, _)| actual_path != path)
        });

        Ok(CsmtProof {
            root: self.root,
            side_nodes: walk.side_nodes,
            non_membership_leaf_data,
            sibling_data: walk.sibling_data,
        })
    }

    pub async fn prove<K: ToFields + ?Sized>(&self, key: &K) -> Result<CsmtProof> {
        self.prove_inner(key, false).await
    }

    /// Proof that also carries the deepest sibling's record, enough to prepare the next update
    pub async fn prove_updatable<K: ToFields + ?Sized>(&self, key: &K) -> Result<CsmtProof> {
        self.prove_inner(key, true).await
    }

    pub async fn prove_compact<K: ToFields + ?Sized>(&self, key: &K) -> Result<CsmtCompactProof> {
        let proof = self.prove(key).await?;
        proof::compact_csmt_proof(&self.hasher, self.config.height, &proof)
    }

    pub fn verify<K: ToFields + ?Sized>(&self, proof: &CsmtProof, key: &K, value: Option<&V>) -> bool {
        proof::verify_csmt_proof(&self.hasher, &self.config, proof, self.root, key, value)
    }

    pub fn verify_compact<K: ToFields + ?Sized>(&self, proof: &CsmtCompactProof, key: &K, value: Option<&V>) -> bool {
        proof::verify_csmt_compact_proof(&self.hasher, &self.config, proof, self.root, key, value)
    }
}
