//! Proofs of the fixed-height trees, their verification and the bitmask compaction codec

use serde::{Deserialize, Serialize};

use crate::config::check_height;
use crate::crypto::{FieldHasher, TreeHasher};
use crate::{Field, Result, SmtError, ToFields, TreeConfig};

/// Side nodes of a path, `side_nodes[0]` being the sibling of the root's on-path child and
/// `side_nodes[height - 1]` the sibling leaf
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseMerkleProof {
    pub root: Field,
    pub side_nodes: Vec<Field>,
}

impl SparseMerkleProof {
    pub fn height(&self) -> usize {
        self.side_nodes.len()
    }
}

/// Proof from a numeric-indexed tree; it carries the index so a verifier needs nothing else
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumIndexProof {
    pub root: Field,
    pub path: Field,
    pub side_nodes: Vec<Field>,
}

impl NumIndexProof {
    pub fn height(&self) -> usize {
        self.side_nodes.len()
    }
}

/// One bit per tree level, bit `i` living in byte `i / 8` at position `i % 8`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BitMask(Vec<u8>);

impl BitMask {
    pub fn new(width: usize) -> Self {
        Self(vec![0u8; width.div_ceil(8)])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn set(&mut self, i: usize) {
        self.0[i / 8] |= 1 << (i % 8);
    }

    pub fn get(&self, i: usize) -> bool {
        self.0.get(i / 8).is_some_and(|byte| (byte >> (i % 8)) & 1 == 1)
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Checks the mask is exactly `width` bits long with no bits set past `width`
    pub(crate) fn check_width(&self, width: usize) -> Result<()> {
        if self.0.len() != width.div_ceil(8) {
            return Err(SmtError::InvalidCompactProof(format!(
                "bit mask has {} bytes, expected {}",
                self.0.len(),
                width.div_ceil(8)
            )));
        }
        if (width..self.0.len() * 8).any(|i| self.get(i)) {
            return Err(SmtError::InvalidCompactProof(
                "bit mask has bits set past the tree height".to_string(),
            ));
        }
        Ok(())
    }
}

/// [`SparseMerkleProof`] with every side node equal to the default node of its level removed
/// and flagged in `bit_mask` instead
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactProof {
    pub root: Field,
    pub height: usize,
    pub bit_mask: BitMask,
    pub side_nodes: Vec<Field>,
}

/// Compacted [`NumIndexProof`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactNumIndexProof {
    pub root: Field,
    pub path: Field,
    pub height: usize,
    pub bit_mask: BitMask,
    pub side_nodes: Vec<Field>,
}

macro_rules! impl_bytes_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn to_bytes(&self) -> Result<Vec<u8>> {
                bincode::serialize(self).map_err(|e| SmtError::Serialization(e.to_string()))
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                bincode::deserialize(bytes).map_err(|e| SmtError::Serialization(e.to_string()))
            }
        }
    };
}

impl_bytes_codec!(CompactProof);
impl_bytes_codec!(CompactNumIndexProof);

/// Fold a leaf up to the root through `side_nodes`, calling `visit` with every internal node
/// produced on the way: its level (0 for the root), hash and children
pub(crate) fn fold_path<H: FieldHasher>(
    hasher: &TreeHasher<H>,
    path: Field,
    side_nodes: &[Field],
    leaf: Field,
    mut visit: impl FnMut(usize, Field, Vec<Field>),
) -> Field {
    let height = side_nodes.len();
    let mut current = leaf;
    for (level, side_node) in side_nodes.iter().enumerate().rev() {
        let (hash, children) = if path.bit_from_msb(level, height) {
            hasher.digest_node(*side_node, current)
        } else {
            hasher.digest_node(current, *side_node)
        };
        visit(level, hash, children);
        current = hash;
    }
    current
}

/// Root implied by a leaf commitment at `path` and its side nodes
pub fn compute_root<H: FieldHasher>(hasher: &TreeHasher<H>, path: Field, side_nodes: &[Field], leaf: Field) -> Field {
    fold_path(hasher, path, side_nodes, leaf, |_, _, _| {})
}

/// Check a proof from a keyed tree. `value = None` checks non-membership.
///
/// Malformed input (wrong height, value not encodable under `config`) is reported as `false`.
pub fn verify_proof<K, V, H>(
    hasher: &TreeHasher<H>,
    config: &TreeConfig,
    proof: &SparseMerkleProof,
    expected_root: Field,
    key: &K,
    value: Option<&V>,
) -> bool
where
    K: ToFields + ?Sized,
    V: ToFields + ?Sized,
    H: FieldHasher,
{
    if proof.root != expected_root || proof.height() != config.height {
        return false;
    }
    let Ok(path) = hasher.key_path(key, config) else {
        return false;
    };
    let Ok(leaf) = hasher.leaf_hash(value, config.hash_value) else {
        return false;
    };
    compute_root(hasher, path, &proof.side_nodes, leaf) == expected_root
}

/// Check a proof from a numeric-indexed tree against the index it carries
pub fn verify_num_index_proof<V, H>(
    hasher: &TreeHasher<H>,
    hash_value: bool,
    proof: &NumIndexProof,
    expected_root: Field,
    value: Option<&V>,
) -> bool
where
    V: ToFields + ?Sized,
    H: FieldHasher,
{
    if proof.root != expected_root || check_height(proof.height()).is_err() {
        return false;
    }
    if !proof.path.fits_in_bits(proof.height()) {
        return false;
    }
    let Ok(leaf) = hasher.leaf_hash(value, hash_value) else {
        return false;
    };
    compute_root(hasher, proof.path, &proof.side_nodes, leaf) == expected_root
}

fn compact_side_nodes(side_nodes: &[Field], defaults: &[Field]) -> (BitMask, Vec<Field>) {
    let mut bit_mask = BitMask::new(side_nodes.len());
    let mut kept = Vec::new();
    for (level, side_node) in side_nodes.iter().enumerate() {
        if *side_node == defaults[level + 1] {
            bit_mask.set(level);
        } else {
            kept.push(*side_node);
        }
    }
    (bit_mask, kept)
}

fn decompact_side_nodes(
    height: usize,
    bit_mask: &BitMask,
    side_nodes: &[Field],
    defaults: &[Field],
) -> Result<Vec<Field>> {
    bit_mask.check_width(height)?;
    let expected = height - bit_mask.count_ones();
    if side_nodes.len() != expected {
        return Err(SmtError::ProofLength {
            expected,
            actual: side_nodes.len(),
        });
    }

    let mut kept = side_nodes.iter();
    let mut full = Vec::with_capacity(height);
    for level in 0..height {
        if bit_mask.get(level) {
            full.push(defaults[level + 1]);
        } else if let Some(side_node) = kept.next() {
            full.push(*side_node);
        } else {
            return Err(SmtError::ProofLength {
                expected,
                actual: side_nodes.len(),
            });
        }
    }
    Ok(full)
}

pub fn compact_proof<H: FieldHasher>(hasher: &TreeHasher<H>, proof: &SparseMerkleProof) -> Result<CompactProof> {
    let height = proof.height();
    check_height(height)?;
    let defaults = hasher.default_nodes(height);
    let (bit_mask, side_nodes) = compact_side_nodes(&proof.side_nodes, &defaults);
    Ok(CompactProof {
        root: proof.root,
        height,
        bit_mask,
        side_nodes,
    })
}

pub fn decompact_proof<H: FieldHasher>(hasher: &TreeHasher<H>, proof: &CompactProof) -> Result<SparseMerkleProof> {
    check_height(proof.height)?;
    let defaults = hasher.default_nodes(proof.height);
    let side_nodes = decompact_side_nodes(proof.height, &proof.bit_mask, &proof.side_nodes, &defaults)?;
    Ok(SparseMerkleProof {
        root: proof.root,
        side_nodes,
    })
}

pub fn compact_num_index_proof<H: FieldHasher>(
    hasher: &TreeHasher<H>,
    proof: &NumIndexProof,
) -> Result<CompactNumIndexProof> {
    let height = proof.height();
    check_height(height)?;
    let defaults = hasher.default_nodes(height);
    let (bit_mask, side_nodes) = compact_side_nodes(&proof.side_nodes, &defaults);
    Ok(CompactNumIndexProof {
        root: proof.root,
        path: proof.path,
        height,
        bit_mask,
        side_nodes,
    })
}

pub fn decompact_num_index_proof<H: FieldHasher>(
    hasher: &TreeHasher<H>,
    proof: &CompactNumIndexProof,
) -> Result<NumIndexProof> {
    check_height(proof.height)?;
    let defaults = hasher.default_nodes(proof.height);
    let side_nodes = decompact_side_nodes(proof.height, &proof.bit_mask, &proof.side_nodes, &defaults)?;
    Ok(NumIndexProof {
        root: proof.root,
        path: proof.path,
        side_nodes,
    })
}

pub fn verify_compact_proof<K, V, H>(
    hasher: &TreeHasher<H>,
    config: &TreeConfig,
    proof: &CompactProof,
    expected_root: Field,
    key: &K,
    value: Option<&V>,
) -> bool
where
    K: ToFields + ?Sized,
    V: ToFields + ?Sized,
    H: FieldHasher,
{
    match decompact_proof(hasher, proof) {
        Ok(proof) => verify_proof(hasher, config, &proof, expected_root, key, value),
        Err(_) => false,
    }
}

pub fn verify_compact_num_index_proof<V, H>(
    hasher: &TreeHasher<H>,
    hash_value: bool,
    proof: &CompactNumIndexProof,
    expected_root: Field,
    value: Option<&V>,
) -> bool
where
    V: ToFields + ?Sized,
    H: FieldHasher,
{
    match decompact_num_index_proof(hasher, proof) {
        Ok(proof) => verify_num_index_proof(hasher, hash_value, &proof, expected_root, value),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Blake3Hasher, EMPTY};

    fn hasher() -> TreeHasher<Blake3Hasher> {
        TreeHasher::new(Blake3Hasher::default())
    }

    #[test]
    fn empty_tree_proof_verifies_non_membership() {
        let th = hasher();
        let defaults = th.default_nodes(4);
        let proof = SparseMerkleProof {
            root: defaults[0],
            side_nodes: defaults[1..].to_vec(),
        };
        let config = TreeConfig::new(4);
        assert!(verify_proof::<_, u64, _>(&th, &config, &proof, defaults[0], &7u64, None));
        assert!(!verify_proof(&th, &config, &proof, defaults[0], &7u64, Some(&1u64)));
        assert!(!verify_proof::<_, u64, _>(&th, &TreeConfig::new(5), &proof, defaults[0], &7u64, None));
    }

    #[test]
    fn compact_round_trip_preserves_order() {
        let th = hasher();
        let defaults = th.default_nodes(6);
        let mut side_nodes = defaults[1..].to_vec();
        side_nodes[1] = Field::from_u64(11);
        side_nodes[4] = Field::from_u64(44);
        let proof = SparseMerkleProof {
            root: Field::from_u64(99),
            side_nodes,
        };

        let compact = compact_proof(&th, &proof).unwrap();
        assert_eq!(compact.side_nodes, vec![Field::from_u64(11), Field::from_u64(44)]);
        assert_eq!(compact.side_nodes.len(), 6 - compact.bit_mask.count_ones());
        assert!(compact.bit_mask.get(0) && !compact.bit_mask.get(1) && !compact.bit_mask.get(4));
        assert_eq!(decompact_proof(&th, &compact).unwrap(), proof);

        let bytes = compact.to_bytes().unwrap();
        assert_eq!(CompactProof::from_bytes(&bytes).unwrap(), compact);
    }

    #[test]
    fn decompact_rejects_wrong_side_node_count() {
        let th = hasher();
        let defaults = th.default_nodes(4);
        let proof = SparseMerkleProof {
            root: defaults[0],
            side_nodes: defaults[1..].to_vec(),
        };
        let mut compact = compact_proof(&th, &proof).unwrap();
        compact.side_nodes.push(Field::from_u64(1));
        assert!(matches!(
            decompact_proof(&th, &compact),
            Err(SmtError::ProofLength { expected: 0, actual: 1 })
        ));

        let mut stray_bit = compact_proof(&th, &proof).unwrap();
        stray_bit.bit_mask = BitMask::from_bytes(vec![0b0001_1111]);
        assert!(matches!(
            decompact_proof(&th, &stray_bit),
            Err(SmtError::InvalidCompactProof(_))
        ));
    }

    #[test]
    fn fold_visits_every_level() {
        let th = hasher();
        let defaults = th.default_nodes(3);
        let mut visited = Vec::new();
        let root = fold_path(&th, Field::from_u64(5), &defaults[1..], EMPTY, |level, hash, children| {
            visited.push((level, hash, children));
        });
        assert_eq!(root, defaults[0]);
        assert_eq!(visited.len(), 3);
        assert_eq!(visited[0].0, 2);
        assert_eq!(visited[0].2, vec![EMPTY, EMPTY]);
        assert!(visited.iter().all(|(level, hash, _)| *hash == defaults[*level]));
    }

    #[test]
    fn num_index_proof_rejects_path_outside_height() {
        let th = hasher();
        let defaults = th.default_nodes(2);
        let proof = NumIndexProof {
            root: defaults[0],
            path: Field::from_u64(4),
            side_nodes: defaults[1..].to_vec(),
        };
        assert!(!verify_num_index_proof::<u64, _>(&th, true, &proof, defaults[0], None));
        let in_range = NumIndexProof {
            path: Field::from_u64(3),
            ..proof
        };
        assert!(verify_num_index_proof::<u64, _>(&th, true, &in_range, defaults[0], None));
    }
}
