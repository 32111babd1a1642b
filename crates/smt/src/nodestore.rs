use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::trace;

use crate::storage::{Batch, Store, StoreOp};
use crate::{Field, Result, SmtError};

/// A node record and the number of tree positions referencing it
#[derive(Debug)]
struct NodeRecord {
    children: Vec<Field>,
    refs: usize,
}

#[derive(Debug)]
struct Inner<V> {
    root: Option<Field>,
    nodes: HashMap<Field, NodeRecord>,
    values: HashMap<Field, V>,
}

/// In-memory store (for testing and demos).
///
/// Clones share the same underlying maps.
#[derive(Debug)]
pub struct MemoryStore<V> {
    inner: Arc<RwLock<Inner<V>>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                root: None,
                nodes: HashMap::new(),
                values: HashMap::new(),
            })),
        }
    }

    /// Only for tests / debugging
    pub fn node_count(&self) -> Result<usize> {
        Ok(self.read()?.nodes.len())
    }

    /// References held on the record under `key`, 0 when absent. Only for tests / debugging
    pub fn node_refs(&self, key: &Field) -> Result<usize> {
        Ok(self.read()?.nodes.get(key).map_or(0, |record| record.refs))
    }

    /// Only for tests / debugging
    pub fn value_count(&self) -> Result<usize> {
        Ok(self.read()?.values.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner<V>>> {
        self.inner
            .read()
            .map_err(|_| SmtError::Store("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner<V>>> {
        self.inner
            .write()
            .map_err(|_| SmtError::Store("memory store lock poisoned".to_string()))
    }
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> Store<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get_root(&self) -> Result<Field> {
        self.read()?.root.ok_or(SmtError::RootNotFound)
    }

    async fn get_nodes(&self, key: &Field) -> Result<Vec<Field>> {
        self.read()?
            .nodes
            .get(key)
            .map(|record| record.children.clone())
            .ok_or(SmtError::NodeNotFound(*key))
    }

    async fn get_value(&self, path: &Field) -> Result<V> {
        self.read()?
            .values
            .get(path)
            .cloned()
            .ok_or(SmtError::ValueNotFound(*path))
    }

    async fn commit(&self, batch: Batch<V>) -> Result<()> {
        let ops = batch.into_ops();
        let count = ops.len();
        // One write lock for the whole batch keeps the commit atomic for readers.
        let mut inner = self.write()?;
        for op in ops {
            match op {
                StoreOp::PutNodes { key, nodes } => {
                    inner
                        .nodes
                        .entry(key)
                        .or_insert(NodeRecord {
                            children: nodes,
                            refs: 0,
                        })
                        .refs += 1;
                }
                StoreOp::DelNodes { key } => {
                    if let Entry::Occupied(mut record) = inner.nodes.entry(key) {
                        record.get_mut().refs -= 1;
                        if record.get().refs == 0 {
                            record.remove();
                        }
                    }
                }
                StoreOp::PutValue { path, value } => {
                    inner.values.insert(path, value);
                }
                StoreOp::DelValue { path } => {
                    inner.values.remove(&path);
                }
                StoreOp::UpdateRoot { root } => inner.root = Some(root),
            }
        }
        trace!(ops = count, "memory store committed batch");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.root = None;
        inner.nodes.clear();
        inner.values.clear();
        Ok(())
    }

    async fn get_values_map(&self) -> Result<BTreeMap<Field, V>> {
        Ok(self
            .read()?
            .values
            .iter()
            .map(|(path, value)| (*path, value.clone()))
            .collect())
    }
}
