//! Keyed, hash-aggregating Merkle tree over the ring keyspace.
//!
//! The tree doubles as the local database index and as the structure the
//! anti-entropy protocol walks when two replicas compare their key sets:
//! equal hashes at a position mean equal key sets underneath, so peers can
//! skip whole subtrees while synchronizing.
//!
//! Nodes live in a flat arena and reference their children by index; a
//! node's `position` is the path of child slots from the root, which is
//! also how peers address each other's nodes on the wire.

use std::collections::BTreeMap;
use std::ops::Bound;

use num_bigint::BigUint;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::consts::MERKLE_BRANCH;
use crate::consts::MERKLE_LEAF_CAP;
use crate::consts::RING_BITS;
use crate::dht::Key;
use crate::error::Error;
use crate::error::Result;

/// log2 of [`MERKLE_BRANCH`]: bits of the key consumed per level.
const BRANCH_BITS: usize = 3;

#[derive(Debug, Clone)]
struct Node<V> {
    /// Inclusive lower bound of the covered range.
    min_key: Key,
    /// Exclusive upper bound. Zero means the range runs to the top of the
    /// ring (the root wraps the entire keyspace).
    max_key: Key,
    hash: Key,
    position: Vec<u8>,
    children: Option<[usize; MERKLE_BRANCH]>,
    entries: BTreeMap<Key, V>,
}

impl<V> Node<V> {
    fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    fn depth(&self) -> usize {
        self.position.len()
    }
}

/// A node and optionally its immediate children, serialized for the
/// anti-entropy exchange. Leaves carry their entries instead of children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireNode {
    #[serde(rename = "HASH")]
    pub hash: Key,
    #[serde(rename = "MIN_KEY")]
    pub min_key: Key,
    #[serde(rename = "KEY")]
    pub max_key: Key,
    #[serde(rename = "POSITION", default)]
    pub position: Vec<u8>,
    #[serde(rename = "KV_PAIRS", default, skip_serializing_if = "Option::is_none")]
    pub kv_pairs: Option<BTreeMap<Key, serde_json::Value>>,
    #[serde(rename = "CHILDREN", default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<WireNode>>,
}

impl WireNode {
    /// Leaves carry entries; internal nodes carry children.
    pub fn is_leaf(&self) -> bool {
        self.kv_pairs.is_some()
    }
}

/// B-ary Merkle tree covering the whole ring keyspace.
#[derive(Debug, Clone)]
pub struct MerkleTree<V> {
    nodes: Vec<Node<V>>,
    len: usize,
}

impl<V> Default for MerkleTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MerkleTree<V> {
    /// A tree with one empty leaf covering the entire keyspace.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                min_key: Key::zero(),
                max_key: Key::zero(),
                hash: Key::zero(),
                position: Vec::new(),
                children: None,
                entries: BTreeMap::new(),
            }],
            len: 0,
        }
    }

    /// Number of entries stored in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is the tree empty?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Aggregate hash of the whole tree; zero iff empty.
    pub fn root_hash(&self) -> Key {
        self.nodes[0].hash.clone()
    }

    /// Which child slot of a node at `depth` covers `key`.
    fn slot_at_depth(key: &Key, depth: usize) -> usize {
        let shift = RING_BITS.saturating_sub(BRANCH_BITS * (depth + 1));
        let shifted = BigUint::from(key) >> shift;
        let slot = shifted & BigUint::from(MERKLE_BRANCH as u8 - 1);
        slot.try_into().unwrap_or(0)
    }

    /// Arena indices from the root to the leaf covering `key`.
    fn path_to_leaf(&self, key: &Key) -> Vec<usize> {
        let mut path = vec![0];
        let mut idx = 0;
        while let Some(children) = self.nodes[idx].children {
            idx = children[Self::slot_at_depth(key, self.nodes[idx].depth())];
            path.push(idx);
        }
        path
    }

    fn compute_hash(&self, idx: usize) -> Key {
        let node = &self.nodes[idx];
        match node.children {
            None => {
                if node.entries.is_empty() {
                    return Key::zero();
                }
                let concatenated: String =
                    node.entries.keys().map(|k| k.to_hex()).collect();
                Key::hash(&concatenated)
            }
            Some(children) => {
                if children.iter().all(|&c| self.nodes[c].hash == Key::zero()) {
                    return Key::zero();
                }
                let concatenated: String = children
                    .iter()
                    .map(|&c| self.nodes[c].hash.to_hex())
                    .collect();
                Key::hash(&concatenated)
            }
        }
    }

    fn rehash_path(&mut self, path: &[usize]) {
        for &idx in path.iter().rev() {
            self.nodes[idx].hash = self.compute_hash(idx);
        }
    }

    /// Subdivide an overfull leaf into [`MERKLE_BRANCH`] children covering
    /// equal sub-ranges, recursing until every leaf fits the cap again so
    /// that the final shape depends only on the stored key set.
    fn split_if_overfull(&mut self, idx: usize) {
        if self.nodes[idx].entries.len() <= MERKLE_LEAF_CAP {
            self.nodes[idx].hash = self.compute_hash(idx);
            return;
        }

        let depth = self.nodes[idx].depth();
        let min_key = self.nodes[idx].min_key.clone();
        let position = self.nodes[idx].position.clone();
        let child_span = Key::two_pow(RING_BITS.saturating_sub(BRANCH_BITS * (depth + 1)));

        let mut children = [0usize; MERKLE_BRANCH];
        let mut lower = min_key;
        for (i, slot) in children.iter_mut().enumerate() {
            let upper = &lower + &child_span;
            let mut child_position = position.clone();
            child_position.push(i as u8);
            *slot = self.nodes.len();
            self.nodes.push(Node {
                min_key: lower,
                max_key: upper.clone(),
                hash: Key::zero(),
                position: child_position,
                children: None,
                entries: BTreeMap::new(),
            });
            lower = upper;
        }

        let entries = std::mem::take(&mut self.nodes[idx].entries);
        for (key, value) in entries {
            let slot = Self::slot_at_depth(&key, depth);
            self.nodes[children[slot]].entries.insert(key, value);
        }

        self.nodes[idx].children = Some(children);
        for &child in &children {
            self.split_if_overfull(child);
        }
        self.nodes[idx].hash = self.compute_hash(idx);
    }

    /// Insert a key-value pair. Fails when the key is already present.
    pub fn insert(&mut self, key: Key, value: V) -> Result<()> {
        let path = self.path_to_leaf(&key);
        let leaf = *path.last().expect("path always contains the root");
        if self.nodes[leaf].entries.contains_key(&key) {
            return Err(Error::DuplicateKey);
        }
        self.nodes[leaf].entries.insert(key, value);
        self.len += 1;
        self.split_if_overfull(leaf);
        self.rehash_path(&path);
        Ok(())
    }

    /// Replace the value of an existing key.
    pub fn update(&mut self, key: &Key, value: V) -> Result<()> {
        let path = self.path_to_leaf(key);
        let leaf = *path.last().expect("path always contains the root");
        match self.nodes[leaf].entries.get_mut(key) {
            Some(stored) => {
                *stored = value;
                self.rehash_path(&path);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Remove a key. Children are not merged back; the protocol tolerates
    /// shape differences between peers.
    pub fn delete(&mut self, key: &Key) -> Result<()> {
        let path = self.path_to_leaf(key);
        let leaf = *path.last().expect("path always contains the root");
        match self.nodes[leaf].entries.remove(key) {
            Some(_) => {
                self.len -= 1;
                self.rehash_path(&path);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Does the tree contain this key?
    pub fn contains(&self, key: &Key) -> bool {
        let path = self.path_to_leaf(key);
        let leaf = *path.last().expect("path always contains the root");
        self.nodes[leaf].entries.contains_key(key)
    }

    /// Does a non-wrapping range `[lo, hi]` intersect the node's range?
    fn node_intersects(&self, idx: usize, lo: &Key, hi: &Key) -> bool {
        let node = &self.nodes[idx];
        if node.max_key == Key::zero() {
            // Range runs to the top of the ring.
            *hi >= node.min_key
        } else {
            node.min_key <= *hi && *lo < node.max_key
        }
    }
}

impl<V: Clone> MerkleTree<V> {
    /// Value stored under `key`.
    pub fn lookup(&self, key: &Key) -> Result<V> {
        let path = self.path_to_leaf(key);
        let leaf = *path.last().expect("path always contains the root");
        self.nodes[leaf]
            .entries
            .get(key)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// All entries whose key lies on the clockwise arc `[lo, hi]`.
    pub fn read_range(&self, lo: &Key, hi: &Key) -> BTreeMap<Key, V> {
        if lo > hi {
            // The arc wraps through zero; take both straight pieces.
            let mut result = self.collect_range(0, lo, &Key::max());
            result.extend(self.collect_range(0, &Key::zero(), hi));
            result
        } else {
            self.collect_range(0, lo, hi)
        }
    }

    fn collect_range(&self, idx: usize, lo: &Key, hi: &Key) -> BTreeMap<Key, V> {
        let node = &self.nodes[idx];
        match node.children {
            None => node
                .entries
                .range((Bound::Included(lo.clone()), Bound::Included(hi.clone())))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Some(children) => {
                let mut result = BTreeMap::new();
                for &child in &children {
                    if self.node_intersects(child, lo, hi) {
                        result.extend(self.collect_range(child, lo, hi));
                    }
                }
                result
            }
        }
    }

    /// All entries in the tree.
    pub fn entries(&self) -> BTreeMap<Key, V> {
        self.read_range(&Key::zero(), &Key::max())
    }

    fn smallest_entry(&self, idx: usize) -> Option<(Key, V)> {
        let node = &self.nodes[idx];
        if node.hash == Key::zero() {
            return None;
        }
        match node.children {
            None => node
                .entries
                .iter()
                .next()
                .map(|(k, v)| (k.clone(), v.clone())),
            Some(children) => children
                .iter()
                .find_map(|&child| self.smallest_entry(child)),
        }
    }

    fn largest_entry(&self, idx: usize) -> Option<(Key, V)> {
        let node = &self.nodes[idx];
        if node.hash == Key::zero() {
            return None;
        }
        match node.children {
            None => node
                .entries
                .iter()
                .next_back()
                .map(|(k, v)| (k.clone(), v.clone())),
            Some(children) => children
                .iter()
                .rev()
                .find_map(|&child| self.largest_entry(child)),
        }
    }

    /// The entry with the smallest key strictly greater than `key`,
    /// wrapping to the smallest entry past the largest key.
    pub fn next(&self, key: &Key) -> Option<(Key, V)> {
        if self.nodes[0].hash == Key::zero() {
            return None;
        }

        if let Some((largest, _)) = self.largest_entry(0) {
            if *key >= largest {
                return self.smallest_entry(0);
            }
        }

        self.next_in_subtree(0, key)
    }

    fn next_in_subtree(&self, idx: usize, key: &Key) -> Option<(Key, V)> {
        let node = &self.nodes[idx];
        match node.children {
            None => node
                .entries
                .range((Bound::Excluded(key.clone()), Bound::Unbounded))
                .next()
                .map(|(k, v)| (k.clone(), v.clone())),
            Some(children) => {
                let start = Self::slot_at_depth(key, node.depth());
                children[start..]
                    .iter()
                    .find_map(|&child| self.next_in_subtree(child, key))
            }
        }
    }
}

impl<V: Clone> MerkleTree<V> {
    fn node_index_at(&self, position: &[u8]) -> Option<usize> {
        let mut idx = 0;
        for &dir in position {
            let children = self.nodes[idx].children?;
            if dir as usize >= MERKLE_BRANCH {
                return None;
            }
            idx = children[dir as usize];
        }
        Some(idx)
    }

    /// Is there a node at this root-relative position?
    pub fn has_node_at(&self, position: &[u8]) -> bool {
        self.node_index_at(position).is_some()
    }
}

impl<V: Clone + Serialize> MerkleTree<V> {
    fn serialize_index(&self, idx: usize, include_children: bool) -> Result<WireNode> {
        let node = &self.nodes[idx];
        let kv_pairs = if node.is_leaf() {
            let mut map = BTreeMap::new();
            for (k, v) in &node.entries {
                map.insert(k.clone(), serde_json::to_value(v).map_err(Error::Serialize)?);
            }
            Some(map)
        } else {
            None
        };

        let children = match (include_children, node.children) {
            (true, Some(children)) => {
                let mut serialized = Vec::with_capacity(MERKLE_BRANCH);
                for &child in &children {
                    serialized.push(self.serialize_index(child, false)?);
                }
                Some(serialized)
            }
            _ => None,
        };

        Ok(WireNode {
            hash: node.hash.clone(),
            min_key: node.min_key.clone(),
            max_key: node.max_key.clone(),
            position: node.position.clone(),
            kv_pairs,
            children,
        })
    }

    /// Serialize the node at `position` (and optionally its immediate
    /// children) for the anti-entropy exchange.
    pub fn serialize_node_at(&self, position: &[u8], include_children: bool) -> Result<WireNode> {
        let idx = self
            .node_index_at(position)
            .ok_or(Error::NoNodeAtPosition)?;
        self.serialize_index(idx, include_children)
    }
}

impl<V: Clone + DeserializeOwned> MerkleTree<V> {
    /// Decode the typed entries of a wire leaf.
    pub fn decode_wire_entries(node: &WireNode) -> Result<BTreeMap<Key, V>> {
        let mut result = BTreeMap::new();
        if let Some(kv_pairs) = &node.kv_pairs {
            for (k, v) in kv_pairs {
                let value: V =
                    serde_json::from_value(v.clone()).map_err(Error::Deserialize)?;
                result.insert(k.clone(), value);
            }
        }
        Ok(result)
    }
}
