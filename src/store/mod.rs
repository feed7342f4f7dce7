//! In-memory database of a peer, indexed by a Merkle tree.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dht::Key;
use crate::error::Error;
use crate::error::Result;

pub mod merkle;

pub use merkle::MerkleTree;
pub use merkle::WireNode;

/// Thread-safe handle to a Merkle-indexed key/value store. Clones share the
/// same underlying tree. The lock is held only for the duration of one
/// primitive, never across network calls.
#[derive(Debug, Clone)]
pub struct Database<V> {
    index: Arc<RwLock<MerkleTree<V>>>,
}

impl<V: Clone> Database<V> {
    /// An empty database.
    pub fn new() -> Self {
        Self {
            index: Arc::new(RwLock::new(MerkleTree::new())),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<MerkleTree<V>>> {
        self.index.read().map_err(|_| Error::DatabaseLockFailed)
    }

    fn write(&self) -> Result<RwLockWriteGuard<MerkleTree<V>>> {
        self.index.write().map_err(|_| Error::DatabaseLockFailed)
    }

    /// Insert a pair; fails with [`Error::DuplicateKey`] when present.
    pub fn insert(&self, key: Key, value: V) -> Result<()> {
        self.write()?.insert(key, value)
    }

    /// Value stored under `key`, or [`Error::NotFound`].
    pub fn lookup(&self, key: &Key) -> Result<V> {
        self.read()?.lookup(key)
    }

    /// Replace an existing value, or [`Error::NotFound`].
    pub fn update(&self, key: &Key, value: V) -> Result<()> {
        self.write()?.update(key, value)
    }

    /// Remove a pair, or [`Error::NotFound`].
    pub fn delete(&self, key: &Key) -> Result<()> {
        self.write()?.delete(key)
    }

    /// Does the database contain `key`?
    pub fn contains(&self, key: &Key) -> Result<bool> {
        Ok(self.read()?.contains(key))
    }

    /// Every pair on the clockwise arc `[lo, hi]`.
    pub fn read_range(&self, lo: &Key, hi: &Key) -> Result<BTreeMap<Key, V>> {
        Ok(self.read()?.read_range(lo, hi))
    }

    /// The pair with the smallest key strictly after `key`, wrapping.
    pub fn next(&self, key: &Key) -> Result<Option<(Key, V)>> {
        Ok(self.read()?.next(key))
    }

    /// All pairs.
    pub fn entries(&self) -> Result<BTreeMap<Key, V>> {
        Ok(self.read()?.entries())
    }

    /// Number of stored pairs.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Is the database empty?
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Aggregate hash of the index; zero iff empty.
    pub fn root_hash(&self) -> Result<Key> {
        Ok(self.read()?.root_hash())
    }

    /// Does the index have a node at this position?
    pub fn has_node_at(&self, position: &[u8]) -> Result<bool> {
        Ok(self.read()?.has_node_at(position))
    }
}

impl<V: Clone + Serialize> Database<V> {
    /// Serialize the index node at `position` for the anti-entropy
    /// exchange.
    pub fn serialize_node_at(&self, position: &[u8], include_children: bool) -> Result<WireNode> {
        self.read()?.serialize_node_at(position, include_children)
    }
}

impl<V: Clone + DeserializeOwned> Database<V> {
    /// Decode the typed entries carried by a wire leaf.
    pub fn decode_wire_entries(node: &WireNode) -> Result<BTreeMap<Key, V>> {
        MerkleTree::<V>::decode_wire_entries(node)
    }
}
