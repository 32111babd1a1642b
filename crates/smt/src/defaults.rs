use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::Field;

/// Memoized chains of empty-subtree hashes, one chain per tree height.
///
/// A cache belongs to exactly one [`TreeHasher`](crate::TreeHasher), so chains computed with
/// different hash functions never mix. `chain[height]` is the empty leaf and `chain[0]` the root of
/// an empty tree.
#[derive(Debug, Default)]
pub struct DefaultNodeCache {
    chains: RwLock<HashMap<usize, Arc<[Field]>>>,
}

impl DefaultNodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the chain for `height`, computing it with `compute` on first use
    pub fn get_or_compute(&self, height: usize, compute: impl FnOnce() -> Vec<Field>) -> Arc<[Field]> {
        if let Some(chain) = self
            .chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&height)
        {
            return Arc::clone(chain);
        }

        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(chains.entry(height).or_insert_with(|| Arc::from(compute())))
    }

    /// Number of heights cached so far
    pub fn len(&self) -> usize {
        self.chains.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_once_per_height() {
        let cache = DefaultNodeCache::new();
        let mut calls = 0;
        let first = cache.get_or_compute(4, || {
            calls += 1;
            vec![Field::ZERO; 5]
        });
        let second = cache.get_or_compute(4, || {
            calls += 1;
            vec![Field::from_u64(1); 5]
        });
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &second));

        cache.get_or_compute(5, || vec![Field::ZERO; 6]);
        assert_eq!(cache.len(), 2);
    }
}
