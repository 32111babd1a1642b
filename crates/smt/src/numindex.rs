//! Fixed-height tree addressed by raw integer index

use std::sync::Arc;

use crate::crypto::{Blake3Hasher, FieldHasher, TreeHasher};
use crate::proof::{self, CompactNumIndexProof, NumIndexProof};
use crate::smt::TreeCore;
use crate::storage::Store;
use crate::{Field, Result, SmtError, ToFields};

/// Sparse Merkle Tree whose leaf paths are the indices themselves, `0..2^height`.
///
/// Same update law as [`SparseMerkleTree`](crate::SparseMerkleTree); proofs carry their index.
pub struct NumIndexSparseMerkleTree<V, S, H = Blake3Hasher> {
    core: TreeCore<V, S, H>,
}

impl<V, S, H> NumIndexSparseMerkleTree<V, S, H>
where
    V: ToFields + Clone + Send + Sync + 'static,
    S: Store<V>,
    H: FieldHasher,
{
    pub async fn build(store: S, hasher: Arc<TreeHasher<H>>, height: usize, hash_value: bool) -> Result<Self> {
        let core = TreeCore::build(store, hasher, height, hash_value).await?;
        Ok(Self { core })
    }

    pub async fn import(store: S, hasher: Arc<TreeHasher<H>>, height: usize, hash_value: bool) -> Result<Self> {
        let core = TreeCore::import(store, hasher, height, hash_value).await?;
        Ok(Self { core })
    }

    pub fn root(&self) -> Field {
        self.core.root()
    }

    pub fn height(&self) -> usize {
        self.core.height()
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

    /// Largest valid index, `2^height - 1`
    pub fn max_index(&self) -> Field {
        let height = self.height();
        let mut bytes = [0u8; crate::FIELD_BYTES];
        for i in 0..height {
            let byte_index = crate::FIELD_BYTES - 1 - (i / 8);
            bytes[byte_index] |= 1 << (i % 8);
        }
        // height <= MAX_HEIGHT keeps this inside the field
        Field::from_bytes_be(bytes).unwrap_or(Field::ZERO)
    }

    fn path(&self, index: impl Into<Field>) -> Result<Field> {
        let index = index.into();
        if !index.fits_in_bits(self.height()) {
            return Err(SmtError::IndexOutOfRange {
                index,
                height: self.height(),
            });
        }
        Ok(index)
    }

    pub async fn get(&self, index: impl Into<Field>) -> Result<Option<V>> {
        let path = self.path(index)?;
        self.core.get_path(path).await
    }

    pub async fn has(&self, index: impl Into<Field>) -> Result<bool> {
        let path = self.path(index)?;
        self.core.has_path(path).await
    }

    pub async fn update(&mut self, index: impl Into<Field>, value: Option<V>) -> Result<Field> {
        let path = self.path(index)?;
        self.core.update_path(path, value).await
    }

    pub async fn update_all<I, F>(&mut self, updates: I) -> Result<Field>
    where
        I: IntoIterator<Item = (F, Option<V>)>,
        F: Into<Field>,
    {
        let updates = updates
            .into_iter()
            .map(|(index, value)| Ok((self.path(index)?, value)))
            .collect::<Result<Vec<_>>>()?;
        self.core.update_paths(updates).await
    }

    pub async fn delete(&mut self, index: impl Into<Field>) -> Result<Field> {
        self.update(index, None).await
    }

    pub async fn set_root(&mut self, root: Field) -> Result<()> {
        self.core.set_root(root).await
    }

    pub async fn prove(&self, index: impl Into<Field>) -> Result<NumIndexProof> {
        self.prove_for_root(index, self.root()).await
    }

    pub async fn prove_for_root(&self, index: impl Into<Field>, root: Field) -> Result<NumIndexProof> {
        let path = self.path(index)?;
        let side_nodes = self.core.side_nodes(path, root).await?;
        Ok(NumIndexProof { root, path, side_nodes })
    }

    pub async fn prove_compact(&self, index: impl Into<Field>) -> Result<CompactNumIndexProof> {
        let proof = self.prove(index).await?;
        proof::compact_num_index_proof(self.core.hasher(), &proof)
    }

    pub fn verify(&self, proof: &NumIndexProof, value: Option<&V>) -> bool {
        proof::verify_num_index_proof(self.core.hasher(), self.core.hash_value(), proof, self.root(), value)
    }

    pub fn verify_compact(&self, proof: &CompactNumIndexProof, value: Option<&V>) -> bool {
        proof::verify_compact_num_index_proof(self.core.hasher(), self.core.hash_value(), proof, self.root(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    type Tree = NumIndexSparseMerkleTree<Field, MemoryStore<Field>>;

    async fn build(height: usize) -> Tree {
        let hasher = TreeHasher::shared(Blake3Hasher::default());
        Tree::build(MemoryStore::new(), hasher, height, true).await.unwrap()
    }

    #[tokio::test]
    async fn index_must_fit_height() {
        let mut tree = build(8).await;
        assert_eq!(tree.max_index(), Field::from_u64(255));
        assert!(tree.update(255u64, Some(Field::from_u64(1))).await.is_ok());
        let root = tree.root();
        assert!(matches!(
            tree.update(256u64, Some(Field::from_u64(1))).await,
            Err(SmtError::IndexOutOfRange { height: 8, .. })
        ));
        assert_eq!(tree.root(), root);
        assert!(matches!(tree.prove(1000u64).await, Err(SmtError::IndexOutOfRange { .. })));
    }

    #[tokio::test]
    async fn proof_carries_index() {
        let mut tree = build(8).await;
        tree.update(7u64, Some(Field::from_u64(70))).await.unwrap();
        let proof = tree.prove(7u64).await.unwrap();
        assert_eq!(proof.path, Field::from_u64(7));
        assert!(tree.verify(&proof, Some(&Field::from_u64(70))));

        let moved = NumIndexProof {
            path: Field::from_u64(6),
            ..proof.clone()
        };
        assert!(!tree.verify(&moved, Some(&Field::from_u64(70))));

        let compact = tree.prove_compact(7u64).await.unwrap();
        assert_eq!(compact.path, proof.path);
        assert!(tree.verify_compact(&compact, Some(&Field::from_u64(70))));
    }

    #[tokio::test]
    async fn raw_values_without_hashing() {
        let hasher = TreeHasher::shared(Blake3Hasher::default());
        let mut tree = NumIndexSparseMerkleTree::<Vec<Field>, MemoryStore<Vec<Field>>>::build(
            MemoryStore::new(),
            hasher,
            4,
            false,
        )
        .await
        .unwrap();

        let root = tree.root();
        let wide = vec![Field::from_u64(1), Field::from_u64(2)];
        assert!(matches!(
            tree.update(1u64, Some(wide)).await,
            Err(SmtError::ValueTooWide { len: 2 })
        ));
        assert_eq!(tree.root(), root);

        tree.update(1u64, Some(vec![Field::from_u64(9)])).await.unwrap();
        let proof = tree.prove(1u64).await.unwrap();
        let leaf_side = proof.side_nodes[3];
        assert_eq!(leaf_side, crate::EMPTY);
        assert!(tree.verify(&proof, Some(&vec![Field::from_u64(9)])));
    }
}
