//! Domain-separated hashing for tree nodes

use std::sync::Arc;

use crate::defaults::DefaultNodeCache;
use crate::{Field, Result, SmtError, ToFields, TreeConfig};

/// Value committed at a leaf that was never written, and at deleted leaves
pub const EMPTY: Field = Field::ZERO;

/// Tag of an empty subtree in the compact tree
pub const EMPTY_PREFIX: Field = Field::from_u64(0);
/// Tag of a compact leaf record `[LEAF_PREFIX, path, value_hash]`
pub const LEAF_PREFIX: Field = Field::from_u64(1);
/// Tag of a compact internal record `[NODE_PREFIX, left, right]`
pub const NODE_PREFIX: Field = Field::from_u64(2);

/// Hash of an empty subtree at any depth of the compact tree
pub const PLACEHOLDER: Field = EMPTY_PREFIX;

/// A hash function over field elements
pub trait FieldHasher: Send + Sync {
    fn hash(&self, inputs: &[Field]) -> Field;
}

/// blake3 in key-derivation mode, output truncated into the field
#[derive(Clone, Debug)]
pub struct Blake3Hasher {
    context: &'static str,
}

impl Blake3Hasher {
    pub const DEFAULT_CONTEXT: &'static str = "sparse-merkle-tree 2024-01-01 field hash";

    /// Hasher whose outputs are domain-separated by `context`
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CONTEXT)
    }
}

impl FieldHasher for Blake3Hasher {
    fn hash(&self, inputs: &[Field]) -> Field {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        for input in inputs {
            hasher.update(input.as_bytes());
        }
        Field::from_digest(*hasher.finalize().as_bytes())
    }
}

/// A [`FieldHasher`] together with the hashing policy of the trees and its default-node cache.
///
/// Trees sharing an `Arc<TreeHasher>` share the cache.
#[derive(Debug, Default)]
pub struct TreeHasher<H> {
    hasher: H,
    defaults: DefaultNodeCache,
}

impl<H: FieldHasher> TreeHasher<H> {
    pub fn new(hasher: H) -> Self {
        Self {
            hasher,
            defaults: DefaultNodeCache::new(),
        }
    }

    pub fn shared(hasher: H) -> Arc<Self> {
        Arc::new(Self::new(hasher))
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    pub fn digest(&self, inputs: &[Field]) -> Field {
        self.hasher.hash(inputs)
    }

    /// Path of a key: its hash, or its single field element when key hashing is off
    pub fn path<K: ToFields + ?Sized>(&self, key: &K, hash_key: bool) -> Result<Field> {
        let fields = key.to_fields();
        if hash_key {
            return Ok(self.digest(&fields));
        }
        match fields.as_slice() {
            [single] => Ok(*single),
            _ => Err(SmtError::KeyTooWide { len: fields.len() }),
        }
    }

    /// Path of a key in a tree built with `config`.
    ///
    /// A hashed key keeps the low `height` bits of its digest, so the path that is walked is also
    /// the one values are stored under. A raw key must already fit in `height` bits.
    pub fn key_path<K: ToFields + ?Sized>(&self, key: &K, config: &TreeConfig) -> Result<Field> {
        let path = self.path(key, config.hash_key)?;
        if config.hash_key {
            return Ok(path.low_bits(config.height));
        }
        if !path.fits_in_bits(config.height) {
            return Err(SmtError::IndexOutOfRange {
                index: path,
                height: config.height,
            });
        }
        Ok(path)
    }

    /// Leaf commitment of a value: its hash, or its single field element when value hashing is off
    pub fn value_hash<V: ToFields + ?Sized>(&self, value: &V, hash_value: bool) -> Result<Field> {
        let fields = value.to_fields();
        if hash_value {
            return Ok(self.digest(&fields));
        }
        match fields.as_slice() {
            [single] => Ok(*single),
            _ => Err(SmtError::ValueTooWide { len: fields.len() }),
        }
    }

    /// Leaf commitment of an optional value, [`EMPTY`] standing for absence
    pub fn leaf_hash<V: ToFields + ?Sized>(&self, value: Option<&V>, hash_value: bool) -> Result<Field> {
        match value {
            Some(value) => self.value_hash(value, hash_value),
            None => Ok(EMPTY),
        }
    }

    /// Internal node of the fixed-height trees: `hash([left, right])`
    pub fn digest_node(&self, left: Field, right: Field) -> (Field, Vec<Field>) {
        let children = vec![left, right];
        (self.digest(&children), children)
    }

    /// Compact leaf record and its hash
    pub fn digest_leaf(&self, path: Field, value_hash: Field) -> (Field, Vec<Field>) {
        let data = vec![LEAF_PREFIX, path, value_hash];
        (self.digest(&data), data)
    }

    /// Compact internal record and its hash
    pub fn digest_compact_node(&self, left: Field, right: Field) -> (Field, Vec<Field>) {
        let data = vec![NODE_PREFIX, left, right];
        (self.digest(&data), data)
    }

    pub fn is_leaf(data: &[Field]) -> bool {
        data.len() == 3 && data[0] == LEAF_PREFIX
    }

    /// `(path, value_hash)` of a compact leaf record
    pub fn parse_leaf(data: &[Field]) -> Option<(Field, Field)> {
        Self::is_leaf(data).then(|| (data[1], data[2]))
    }

    /// `(left, right)` of a compact internal record
    pub fn parse_node(data: &[Field]) -> Option<(Field, Field)> {
        (data.len() == 3 && data[0] == NODE_PREFIX).then(|| (data[1], data[2]))
    }

    /// Empty-subtree hashes from the root (`[0]`) down to the empty leaf (`[height]`)
    pub fn default_nodes(&self, height: usize) -> Arc<[Field]> {
        self.defaults.get_or_compute(height, || {
            let mut nodes = vec![EMPTY; height + 1];
            for i in (0..height).rev() {
                nodes[i] = self.digest(&[nodes[i + 1], nodes[i + 1]]);
            }
            nodes
        })
    }

    pub fn default_node_cache(&self) -> &DefaultNodeCache {
        &self.defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> TreeHasher<Blake3Hasher> {
        TreeHasher::new(Blake3Hasher::default())
    }

    #[test]
    fn default_nodes_chain_upwards() {
        let th = hasher();
        let nodes = th.default_nodes(8);
        assert_eq!(nodes.len(), 9);
        assert_eq!(nodes[8], EMPTY);
        for i in 0..8 {
            assert_eq!(nodes[i], th.digest(&[nodes[i + 1], nodes[i + 1]]));
        }
        assert!(Arc::ptr_eq(&nodes, &th.default_nodes(8)));
    }

    #[test]
    fn leaf_and_node_digests_never_collide() {
        let th = hasher();
        let a = Field::from_u64(7);
        let b = Field::from_u64(9);
        let (leaf, leaf_data) = th.digest_leaf(a, b);
        let (node, node_data) = th.digest_compact_node(a, b);
        assert_ne!(leaf, node);
        assert_eq!(TreeHasher::<Blake3Hasher>::parse_leaf(&leaf_data), Some((a, b)));
        assert_eq!(TreeHasher::<Blake3Hasher>::parse_node(&node_data), Some((a, b)));
        assert!(TreeHasher::<Blake3Hasher>::parse_leaf(&node_data).is_none());
        assert!(TreeHasher::<Blake3Hasher>::parse_node(&leaf_data).is_none());
    }

    #[test]
    fn raw_paths_and_values_need_a_single_element() {
        let th = hasher();
        assert_eq!(th.path(&Field::from_u64(3), false).unwrap(), Field::from_u64(3));
        assert!(matches!(th.path("abc", false), Err(SmtError::KeyTooWide { len: 2 })));
        assert_eq!(th.value_hash(&5u64, false).unwrap(), Field::from_u64(5));
        assert!(matches!(
            th.value_hash(&vec![Field::ZERO, Field::ZERO], false),
            Err(SmtError::ValueTooWide { len: 2 })
        ));
        assert_ne!(th.value_hash(&5u64, true).unwrap(), Field::from_u64(5));
    }

    #[test]
    fn key_paths_fit_the_tree_height() {
        let th = hasher();
        let hashed = TreeConfig::new(8);
        let path = th.key_path("carol", &hashed).unwrap();
        assert!(path.fits_in_bits(8));
        assert_eq!(path, th.path("carol", true).unwrap().low_bits(8));
        assert_eq!(
            th.key_path("carol", &TreeConfig::new(254)).unwrap(),
            th.path("carol", true).unwrap()
        );

        let raw = TreeConfig::new(8).with_hash_key(false);
        assert_eq!(th.key_path(&255u64, &raw).unwrap(), Field::from_u64(255));
        assert!(matches!(
            th.key_path(&257u64, &raw),
            Err(SmtError::IndexOutOfRange { height: 8, .. })
        ));
    }

    #[test]
    fn context_separates_domains() {
        let a = Blake3Hasher::new("domain a");
        let b = Blake3Hasher::new("domain b");
        let input = [Field::from_u64(1)];
        assert_ne!(a.hash(&input), b.hash(&input));
        assert_eq!(a.hash(&input), Blake3Hasher::new("domain a").hash(&input));
    }
}
