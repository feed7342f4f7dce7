//! Successor list of a ring peer.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::dht::Key;
use crate::dht::RemotePeer;
use crate::error::Error;
use crate::error::Result;

/// A bounded list of the peers following this one on the ring, kept in
/// clockwise order starting just after `starting_key`. Multiple successors
/// guard against a single point of failure.
///
/// A `std::collections` ordered set cannot express this ordering: each
/// prospective position depends on both its clockwise neighbours, so the
/// list implements its own insert.
#[derive(Debug, Clone)]
pub struct SuccessorList {
    starting_key: Key,
    max: usize,
    peers: Arc<RwLock<Vec<RemotePeer>>>,
}

impl SuccessorList {
    /// Build an empty list anchored at the owning peer's id.
    pub fn new(starting_key: Key, max: usize) -> Self {
        Self {
            starting_key,
            max,
            peers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<Vec<RemotePeer>>> {
        self.peers.read().map_err(|_| Error::FailedToReadSuccessors)
    }

    fn write(&self) -> Result<RwLockWriteGuard<Vec<RemotePeer>>> {
        self.peers
            .write()
            .map_err(|_| Error::FailedToWriteSuccessors)
    }

    /// Insert a peer at its clockwise position. Returns false when a peer
    /// with the same id is already present, the peer is the anchor itself,
    /// or the peer does not belong in the bounded list.
    pub fn insert(&self, new_peer: &RemotePeer) -> Result<bool> {
        if new_peer.id == self.starting_key {
            return Ok(false);
        }

        let mut peers = self.write()?;

        if peers.is_empty() {
            peers.push(new_peer.clone());
            return Ok(true);
        }

        let mut previous_key = self.starting_key.clone();
        let mut position = None;
        for (i, entry) in peers.iter().enumerate() {
            if new_peer.id == entry.id {
                return Ok(false);
            }
            if new_peer.id.in_between(&previous_key, &entry.id, true) {
                position = Some(i);
                break;
            }
            previous_key = entry.id.clone();
        }

        if let Some(i) = position {
            peers.insert(i, new_peer.clone());
            if peers.len() > self.max {
                peers.pop();
            }
            return Ok(true);
        }

        if peers.len() < self.max {
            peers.push(new_peer.clone());
            return Ok(true);
        }

        Ok(false)
    }

    /// Replace the whole list. The anchor never lists itself.
    pub fn populate(&self, mut entries: Vec<RemotePeer>) -> Result<()> {
        entries.retain(|p| p.id != self.starting_key);
        let mut peers = self.write()?;
        *peers = entries;
        Ok(())
    }

    /// First entry whose predecessor-bounded arc contains `key`.
    pub fn lookup(&self, key: &Key) -> Result<Option<RemotePeer>> {
        let peers = self.read()?;
        let mut previous_key = self.starting_key.clone();
        for entry in peers.iter() {
            if key.in_between(&previous_key, &entry.id, true) {
                return Ok(Some(entry.clone()));
            }
            previous_key = entry.id.clone();
        }
        Ok(None)
    }

    /// Like [`SuccessorList::lookup`] but skips entries whose listener no
    /// longer answers, scanning forward around the list.
    pub async fn lookup_living(&self, key: &Key) -> Result<Option<RemotePeer>> {
        let entries = self.entries()?;
        if entries.is_empty() {
            return Ok(None);
        }

        let start = match self.lookup(key)? {
            Some(succ) => entries
                .iter()
                .position(|p| p.id == succ.id)
                .unwrap_or(0),
            None => 0,
        };

        for offset in 0..entries.len() {
            let candidate = &entries[(start + offset) % entries.len()];
            if candidate.is_alive().await {
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }

    /// First entry that still answers, in clockwise order.
    pub async fn first_living(&self) -> Result<Option<RemotePeer>> {
        for entry in self.entries()? {
            if entry.is_alive().await {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Remove the entry with the given id, if present.
    pub fn delete(&self, id: &Key) -> Result<()> {
        let mut peers = self.write()?;
        peers.retain(|p| p.id != *id);
        Ok(())
    }

    /// Does an entry with this id exist?
    pub fn contains(&self, id: &Key) -> Result<bool> {
        Ok(self.read()?.iter().any(|p| p.id == *id))
    }

    /// The entry at index `n`, if the list is that long.
    pub fn nth(&self, n: usize) -> Result<Option<RemotePeer>> {
        Ok(self.read()?.get(n).cloned())
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Result<Vec<RemotePeer>> {
        Ok(self.read()?.clone())
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Is the list empty?
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }
}
