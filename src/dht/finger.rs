//! Finger table of the Chord ring.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::consts::RING_BITS;
use crate::dht::Key;
use crate::dht::RemotePeer;
use crate::error::Error;
use crate::error::Result;

/// One routing entry: the best-known successor of `lower_bound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finger {
    /// Lower bound of the covered range.
    pub lower_bound: Key,
    /// Upper bound of the covered range.
    pub upper_bound: Key,
    /// Peer succeeding the lower bound.
    pub successor: RemotePeer,
}

/// Log-scale routing table. Entry `i` covers the clockwise range
/// `[id + 2^i, id + 2^(i+1) - 1]`; the ranges tile the whole ring.
#[derive(Debug, Clone)]
pub struct FingerTable {
    starting_key: Key,
    table: Arc<RwLock<Vec<Finger>>>,
}

impl FingerTable {
    /// Build an empty table anchored at the owning peer's id.
    pub fn new(starting_key: Key) -> Self {
        Self {
            starting_key,
            table: Arc::new(RwLock::new(Vec::with_capacity(RING_BITS))),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<Vec<Finger>>> {
        self.table.read().map_err(|_| Error::FingerLockFailed)
    }

    fn write(&self) -> Result<RwLockWriteGuard<Vec<Finger>>> {
        self.table.write().map_err(|_| Error::FingerLockFailed)
    }

    /// The range entry `n` should cover.
    pub fn nth_range(&self, n: usize) -> (Key, Key) {
        let lower = &self.starting_key + &Key::two_pow(n);
        let upper = &(&self.starting_key + &Key::two_pow(n + 1)) - 1;
        (lower, upper)
    }

    /// Append a finger to the end of the table.
    pub fn add_finger(&self, finger: Finger) -> Result<()> {
        self.write()?.push(finger);
        Ok(())
    }

    /// Point entry `n` at a new successor.
    pub fn edit_nth(&self, n: usize, successor: RemotePeer) -> Result<()> {
        let mut table = self.write()?;
        match table.get_mut(n) {
            Some(finger) => {
                finger.successor = successor;
                Ok(())
            }
            None => Err(Error::NoRoute),
        }
    }

    /// The successor recorded at entry `n`.
    pub fn get_nth(&self, n: usize) -> Result<RemotePeer> {
        self.read()?
            .get(n)
            .map(|f| f.successor.clone())
            .ok_or(Error::NoRoute)
    }

    /// Find the successor of `key` by scanning ranges.
    pub fn lookup(&self, key: &Key) -> Result<RemotePeer> {
        let table = self.read()?;
        for finger in table.iter() {
            if key.in_between(&finger.lower_bound, &finger.upper_bound, true) {
                return Ok(finger.successor.clone());
            }
        }
        Err(Error::NoRoute)
    }

    /// A new peer owns `[min_key, id]`; entries whose lower bound falls on
    /// that arc now resolve to it.
    pub fn adjust_fingers(&self, new_peer: &RemotePeer) -> Result<()> {
        let mut table = self.write()?;
        for finger in table.iter_mut() {
            if finger
                .lower_bound
                .in_between(&new_peer.min_key, &new_peer.id, true)
            {
                finger.successor = new_peer.clone();
            }
        }
        Ok(())
    }

    /// Swap every occurrence of a dead peer for its replacement.
    pub fn replace_dead_peer(&self, dead: &RemotePeer, replacement: &RemotePeer) -> Result<()> {
        let mut table = self.write()?;
        for finger in table.iter_mut() {
            if finger.successor.id == dead.id {
                finger.successor = replacement.clone();
            }
        }
        Ok(())
    }

    /// Has the table been populated yet?
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Number of entries currently in the table.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Result<Vec<Finger>> {
        Ok(self.read()?.clone())
    }
}
