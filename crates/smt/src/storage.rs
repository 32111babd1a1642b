//! Store contract consumed by the trees, and the batch of staged writes it commits

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::{Field, Result, SmtError};

/// One staged write.
///
/// Node records are content addressed, so one record can sit at several positions of a tree.
/// `PutNodes` adds a reference to the record under `key` and `DelNodes` drops one; the record
/// goes away with its last reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp<V> {
    PutNodes { key: Field, nodes: Vec<Field> },
    DelNodes { key: Field },
    PutValue { path: Field, value: V },
    DelValue { path: Field },
    UpdateRoot { root: Field },
}

/// Writes staged by one mutating tree operation, applied by [`Store::commit`] all at once.
///
/// Node puts are also indexed so that later steps of the same operation read records earlier
/// steps staged.
#[derive(Clone, Debug)]
pub struct Batch<V> {
    ops: Vec<StoreOp<V>>,
    staged_nodes: HashMap<Field, Vec<Field>>,
}

impl<V> Batch<V> {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            staged_nodes: HashMap::new(),
        }
    }

    pub fn prepare_update_root(&mut self, root: Field) {
        self.ops.push(StoreOp::UpdateRoot { root });
    }

    pub fn prepare_put_nodes(&mut self, key: Field, nodes: Vec<Field>) {
        self.staged_nodes.insert(key, nodes.clone());
        self.ops.push(StoreOp::PutNodes { key, nodes });
    }

    pub fn prepare_del_nodes(&mut self, key: Field) {
        self.ops.push(StoreOp::DelNodes { key });
    }

    pub fn prepare_put_value(&mut self, path: Field, value: V) {
        self.ops.push(StoreOp::PutValue { path, value });
    }

    pub fn prepare_del_value(&mut self, path: Field) {
        self.ops.push(StoreOp::DelValue { path });
    }

    /// Discard everything staged so far
    pub fn clear(&mut self) {
        self.ops.clear();
        self.staged_nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[StoreOp<V>] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp<V>> {
        self.ops
    }

    /// Record staged under `key` by a put in this batch.
    ///
    /// A staged delete only drops a reference, so it never hides a record from readers.
    pub(crate) fn staged_nodes(&self, key: &Field) -> Option<&[Field]> {
        self.staged_nodes.get(key).map(Vec::as_slice)
    }
}

impl<V> Default for Batch<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference-counted, content-addressed node storage, path-addressed value storage and a root
/// pointer.
///
/// Reads see committed state only. Writes go through a [`Batch`] obtained from [`Store::begin`],
/// and [`Store::commit`] must apply a batch atomically.
#[async_trait]
pub trait Store<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    fn begin(&self) -> Batch<V> {
        Batch::new()
    }

    /// Fails with [`SmtError::RootNotFound`] if no root was ever committed
    async fn get_root(&self) -> Result<Field>;

    /// Fails with [`SmtError::NodeNotFound`] if absent
    async fn get_nodes(&self, key: &Field) -> Result<Vec<Field>>;

    /// Fails with [`SmtError::ValueNotFound`] if absent
    async fn get_value(&self, path: &Field) -> Result<V>;

    async fn commit(&self, batch: Batch<V>) -> Result<()>;

    /// Erase the whole store
    async fn clear(&self) -> Result<()>;

    /// Dump of every stored value, for export tooling
    async fn get_values_map(&self) -> Result<BTreeMap<Field, V>> {
        Err(SmtError::Unsupported("get_values_map"))
    }
}
