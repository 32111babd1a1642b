use serde::{Deserialize, Serialize};

use crate::crypto::{FieldHasher, TreeHasher, PLACEHOLDER};
use crate::proof::BitMask;
use crate::{Field, Result, SmtError, ToFields, TreeConfig};

/// Proof from a [`CompactSparseMerkleTree`](super::CompactSparseMerkleTree).
///
/// `side_nodes` are listed from the deepest level up to the root's children and stop where the
/// path's leaf (or empty subtree) sits, so their count varies per path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsmtProof {
    pub root: Field,
    pub side_nodes: Vec<Field>,
    /// For non-membership: the leaf record found where the queried path ends, if any
    pub non_membership_leaf_data: Option<Vec<Field>>,
    /// Record of the deepest side node, present in updatable proofs
    pub sibling_data: Option<Vec<Field>>,
}

/// [`CsmtProof`] with placeholder side nodes flagged in `bit_mask` instead of listed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsmtCompactProof {
    pub root: Field,
    pub side_nodes: Vec<Field>,
    pub non_membership_leaf_data: Option<Vec<Field>>,
    pub bit_mask: BitMask,
    pub num_side_nodes: usize,
    pub sibling_data: Option<Vec<Field>>,
}

impl CsmtCompactProof {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SmtError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SmtError::Serialization(e.to_string()))
    }
}

fn sanity_check<H: FieldHasher>(hasher: &TreeHasher<H>, depth: usize, proof: &CsmtProof) -> bool {
    if proof.side_nodes.len() > depth {
        return false;
    }
    if let Some(leaf_data) = &proof.non_membership_leaf_data {
        if !TreeHasher::<H>::is_leaf(leaf_data) {
            return false;
        }
    }
    // Sibling data must be the preimage of the deepest side node.
    if let Some(sibling_data) = &proof.sibling_data {
        match proof.side_nodes.first() {
            Some(deepest) if hasher.digest(sibling_data) == *deepest => {}
            _ => return false,
        }
    }
    true
}

/// Verify `proof` and return the node records it implies, deepest first.
///
/// A verifier holding the records can stage them into a store before applying the next update.
/// `value = None` checks non-membership. Returns `None` when the proof does not verify.
pub fn verify_csmt_proof_with_updates<K, V, H>(
    hasher: &TreeHasher<H>,
    config: &TreeConfig,
    proof: &CsmtProof,
    expected_root: Field,
    key: &K,
    value: Option<&V>,
) -> Option<Vec<(Field, Vec<Field>)>>
where
    K: ToFields + ?Sized,
    V: ToFields + ?Sized,
    H: FieldHasher,
{
    if proof.root != expected_root || !sanity_check(hasher, config.height, proof) {
        return None;
    }
    let path = hasher.key_path(key, config).ok()?;

    let mut updates = Vec::with_capacity(proof.side_nodes.len() + 1);
    let mut current = match value {
        None => match &proof.non_membership_leaf_data {
            None => PLACEHOLDER,
            Some(leaf_data) => {
                let (actual_path, value_hash) = TreeHasher::<H>::parse_leaf(leaf_data)?;
                // The leaf must belong to another path, or the key would be present.
                if actual_path == path {
                    return None;
                }
                let (hash, data) = hasher.digest_leaf(actual_path, value_hash);
                updates.push((hash, data));
                hash
            }
        },
        Some(value) => {
            let value_hash = hasher.value_hash(value, config.hash_value).ok()?;
            let (hash, data) = hasher.digest_leaf(path, value_hash);
            updates.push((hash, data));
            hash
        }
    };

    let count = proof.side_nodes.len();
    for (i, side_node) in proof.side_nodes.iter().enumerate() {
        let (hash, data) = if path.bit_from_msb(count - 1 - i, config.height) {
            hasher.digest_compact_node(*side_node, current)
        } else {
            hasher.digest_compact_node(current, *side_node)
        };
        updates.push((hash, data));
        current = hash;
    }

    (current == expected_root).then_some(updates)
}

pub fn verify_csmt_proof<K, V, H>(
    hasher: &TreeHasher<H>,
    config: &TreeConfig,
    proof: &CsmtProof,
    expected_root: Field,
    key: &K,
    value: Option<&V>,
) -> bool
where
    K: ToFields + ?Sized,
    V: ToFields + ?Sized,
    H: FieldHasher,
{
    verify_csmt_proof_with_updates(hasher, config, proof, expected_root, key, value).is_some()
}

pub fn compact_csmt_proof<H: FieldHasher>(
    hasher: &TreeHasher<H>,
    depth: usize,
    proof: &CsmtProof,
) -> Result<CsmtCompactProof> {
    if !sanity_check(hasher, depth, proof) {
        return Err(SmtError::InvalidProof);
    }

    let mut bit_mask = BitMask::new(proof.side_nodes.len());
    let mut side_nodes = Vec::new();
    for (i, side_node) in proof.side_nodes.iter().enumerate() {
        if *side_node == PLACEHOLDER {
            bit_mask.set(i);
        } else {
            side_nodes.push(*side_node);
        }
    }

    Ok(CsmtCompactProof {
        root: proof.root,
        side_nodes,
        non_membership_leaf_data: proof.non_membership_leaf_data.clone(),
        bit_mask,
        num_side_nodes: proof.side_nodes.len(),
        sibling_data: proof.sibling_data.clone(),
    })
}

pub fn decompact_csmt_proof<H: FieldHasher>(
    hasher: &TreeHasher<H>,
    depth: usize,
    proof: &CsmtCompactProof,
) -> Result<CsmtProof> {
    if proof.num_side_nodes > depth {
        return Err(SmtError::InvalidCompactProof(format!(
            "{} side nodes exceed depth {depth}",
            proof.num_side_nodes
        )));
    }
    proof.bit_mask.check_width(proof.num_side_nodes)?;
    let expected = proof.num_side_nodes - proof.bit_mask.count_ones();
    if proof.side_nodes.len() != expected {
        return Err(SmtError::ProofLength {
            expected,
            actual: proof.side_nodes.len(),
        });
    }

    let mut kept = proof.side_nodes.iter().copied();
    let side_nodes = (0..proof.num_side_nodes)
        .map(|i| {
            if proof.bit_mask.get(i) {
                Ok(PLACEHOLDER)
            } else {
                kept.next().ok_or(SmtError::ProofLength {
                    expected,
                    actual: proof.side_nodes.len(),
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let decompacted = CsmtProof {
        root: proof.root,
        side_nodes,
        non_membership_leaf_data: proof.non_membership_leaf_data.clone(),
        sibling_data: proof.sibling_data.clone(),
    };
    if !sanity_check(hasher, depth, &decompacted) {
        return Err(SmtError::InvalidProof);
    }
    Ok(decompacted)
}

pub fn verify_csmt_compact_proof<K, V, H>(
    hasher: &TreeHasher<H>,
    config: &TreeConfig,
    proof: &CsmtCompactProof,
    expected_root: Field,
    key: &K,
    value: Option<&V>,
) -> bool
where
    K: ToFields + ?Sized,
    V: ToFields + ?Sized,
    H: FieldHasher,
{
    match decompact_csmt_proof(hasher, config.height, proof) {
        Ok(proof) => verify_csmt_proof(hasher, config, &proof, expected_root, key, value),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Blake3Hasher;

    #[test]
    fn empty_root_proves_absence() {
        let th = TreeHasher::new(Blake3Hasher::default());
        let config = TreeConfig::new(16);
        let proof = CsmtProof {
            root: PLACEHOLDER,
            side_nodes: Vec::new(),
            non_membership_leaf_data: None,
            sibling_data: None,
        };
        assert!(verify_csmt_proof::<_, u64, _>(&th, &config, &proof, PLACEHOLDER, "k", None));
        assert!(!verify_csmt_proof(&th, &config, &proof, PLACEHOLDER, "k", Some(&1u64)));
    }

    #[test]
    fn leaf_data_for_the_same_path_is_not_absence() {
        let th = TreeHasher::new(Blake3Hasher::default());
        let config = TreeConfig::new(16);
        let path = th.key_path("k", &config).unwrap();
        let (root, data) = th.digest_leaf(path, Field::from_u64(5));
        let proof = CsmtProof {
            root,
            side_nodes: Vec::new(),
            non_membership_leaf_data: Some(data),
            sibling_data: None,
        };
        assert!(!verify_csmt_proof::<_, u64, _>(&th, &config, &proof, root, "k", None));
    }

    #[test]
    fn compaction_round_trip() {
        let th = TreeHasher::new(Blake3Hasher::default());
        let proof = CsmtProof {
            root: Field::from_u64(1),
            side_nodes: vec![Field::from_u64(7), PLACEHOLDER, PLACEHOLDER, Field::from_u64(9)],
            non_membership_leaf_data: None,
            sibling_data: None,
        };
        let compact = compact_csmt_proof(&th, 16, &proof).unwrap();
        assert_eq!(compact.side_nodes.len(), 2);
        assert_eq!(compact.num_side_nodes, 4);
        assert_eq!(decompact_csmt_proof(&th, 16, &compact).unwrap(), proof);
        assert!(decompact_csmt_proof(&th, 3, &compact).is_err());

        let bytes = compact.to_bytes().unwrap();
        assert_eq!(CsmtCompactProof::from_bytes(&bytes).unwrap(), compact);
    }

    #[test]
    fn sibling_data_must_hash_to_deepest_side_node() {
        let th = TreeHasher::new(Blake3Hasher::default());
        let (sibling, sibling_data) = th.digest_leaf(Field::from_u64(3), Field::from_u64(4));
        let mut proof = CsmtProof {
            root: Field::from_u64(1),
            side_nodes: vec![sibling],
            non_membership_leaf_data: None,
            sibling_data: Some(sibling_data),
        };
        assert!(compact_csmt_proof(&th, 8, &proof).is_ok());
        proof.side_nodes[0] = Field::from_u64(2);
        assert!(compact_csmt_proof(&th, 8, &proof).is_err());
    }
}
