//! Anti-entropy between fragment replicas.
//!
//! Two peers compare their Merkle trees top-down. Matching hashes prune a
//! whole subtree; differing internal nodes recurse child by child; at the
//! leaves each side retrieves the keys it is missing with a full
//! replicated read. Global maintenance additionally walks the local
//! database and pushes away fragments this peer should not hold at all.

use async_recursion::async_recursion;
use rand::Rng;

use crate::dht::Key;
use crate::dht::RemotePeer;
use crate::error::Error;
use crate::error::Result;
use crate::node::dhash::DhashInner;
use crate::rpc::ExchangeNodeRequest;
use crate::rpc::Request;
use crate::store::WireNode;

impl DhashInner {
    /// Send our node at a position, receive the peer's node at the same
    /// position. Fails when the peer's tree has no such node; the caller
    /// treats that as shape divergence and stops descending.
    async fn exchange_node(
        &self,
        peer: &RemotePeer,
        local_node: &WireNode,
        lo: &Key,
        hi: &Key,
    ) -> Result<WireNode> {
        let resp = peer
            .send_request(&Request::ExchangeNode(ExchangeNodeRequest {
                node: local_node.clone(),
                requester: self.state.to_remote_peer()?,
                lower_bound: lo.clone(),
                upper_bound: hi.clone(),
            }))
            .await?;
        serde_json::from_value(resp).map_err(Error::Deserialize)
    }

    /// Handler side of the exchange: answer with our node at the sender's
    /// position, repairing our own tree from the sender's node while we
    /// are at it.
    pub(crate) async fn exchange_node_handler(
        &self,
        req: ExchangeNodeRequest,
    ) -> Result<serde_json::Value> {
        let local = self.db.serialize_node_at(&req.node.position, true)?;
        self.compare_nodes(
            &req.node,
            &local,
            &req.requester,
            &req.lower_bound,
            &req.upper_bound,
        )
        .await?;
        serde_json::to_value(local).map_err(Error::Serialize)
    }

    /// Bring our key set on `[lo, hi]` up to date with a replica's.
    pub(crate) async fn synchronize(
        &self,
        peer: &RemotePeer,
        lo: &Key,
        hi: &Key,
    ) -> Result<()> {
        self.synchronize_at(peer, lo, hi, Vec::new()).await
    }

    #[async_recursion]
    async fn synchronize_at(
        &self,
        peer: &RemotePeer,
        lo: &Key,
        hi: &Key,
        position: Vec<u8>,
    ) -> Result<()> {
        let local = match self.db.serialize_node_at(&position, true) {
            Ok(node) => node,
            Err(Error::NoNodeAtPosition) => return Ok(()),
            Err(e) => return Err(e),
        };

        let remote = match self.exchange_node(peer, &local, lo, hi).await {
            Ok(node) => node,
            // The peer's tree does not subdivide the way ours does, or the
            // peer is gone; either way this branch is done.
            Err(e) => {
                tracing::trace!(target = %peer, error = %e, "stopping sync branch");
                return Ok(());
            }
        };

        if remote.hash == local.hash {
            return Ok(());
        }

        self.compare_nodes(&remote, &local, peer, lo, hi).await?;

        if let (Some(remote_children), Some(local_children)) =
            (&remote.children, &local.children)
        {
            for (i, (remote_child, local_child)) in
                remote_children.iter().zip(local_children.iter()).enumerate()
            {
                if remote_child.hash != local_child.hash {
                    let mut child_position = position.clone();
                    child_position.push(i as u8);
                    self.synchronize_at(peer, lo, hi, child_position).await?;
                }
            }
        }

        Ok(())
    }

    /// Leaf-level repair: pull any key on `[lo, hi]` that the remote node
    /// proves exists and we lack.
    async fn compare_nodes(
        &self,
        remote: &WireNode,
        local: &WireNode,
        peer: &RemotePeer,
        lo: &Key,
        hi: &Key,
    ) -> Result<()> {
        if remote.is_leaf() {
            if let Some(kv_pairs) = &remote.kv_pairs {
                for key in kv_pairs.keys() {
                    if self.is_missing(key, lo, hi)? {
                        self.retrieve_missing(key).await?;
                    }
                }
            }
        } else if local.is_leaf() {
            // The remote subdivides where we do not; ask it for everything
            // on our node's range instead of descending.
            let upper_inclusive = &local.max_key - 1u64;
            let theirs = self
                .read_range_remote(peer, &local.min_key, &upper_inclusive)
                .await?;
            for key in theirs.keys() {
                if self.is_missing(key, lo, hi)? {
                    self.retrieve_missing(key).await?;
                }
            }
        }
        Ok(())
    }

    fn is_missing(&self, key: &Key, lo: &Key, hi: &Key) -> Result<bool> {
        Ok(key.in_between(lo, hi, true) && !self.db.contains(key)?)
    }

    /// Fetch a key we should replicate: reconstruct the value, re-encode
    /// it and keep one fragment picked at random.
    async fn retrieve_missing(&self, key: &Key) -> Result<()> {
        tracing::debug!(key = %key, "retrieving missing key");
        let value = self.read_bytes(key).await?;
        let fragments = self.ida.encode_bytes(&value);
        let pick = rand::thread_rng().gen_range(0..fragments.len());
        self.db.insert(key.clone(), fragments[pick].clone())
    }

    /// Push away fragments whose key this peer no longer succeeds: for
    /// each region of the database, find the key's `n` successors and, if
    /// we are not among them, hand each of them whatever they lack and
    /// drop our copies.
    pub(crate) async fn run_global_maintenance(&self) -> Result<()> {
        let own_id = self.state.id().clone();
        let starting_key = match self.db.next(&own_id)? {
            Some((key, _)) => key,
            None => return Ok(()),
        };

        let mut current_key = own_id.clone();
        let mut first_iteration = true;
        loop {
            let next_key = match self.db.next(&current_key)? {
                Some((key, _)) => key,
                None => break,
            };

            // The walk wrapped back around to where it started.
            if !first_iteration && next_key.in_between(&own_id, &starting_key, true) {
                break;
            }
            first_iteration = false;

            let succs = self.state.get_n_successors(&next_key, self.ida.n()).await?;
            let first_succ_id = match succs.first() {
                Some(peer) => peer.id.clone(),
                None => break,
            };

            let misplaced = !succs.iter().any(|s| s.id == own_id);
            if misplaced {
                tracing::debug!(key = %next_key, "re-homing misplaced fragments");
                for succ in &succs {
                    let theirs = self
                        .read_range_remote(succ, &next_key, &first_succ_id)
                        .await?;
                    let ours = self.db.read_range(&next_key, &first_succ_id)?;
                    for (key, fragment) in ours {
                        if !theirs.contains_key(&key) {
                            self.create_key(&key, &fragment, succ).await?;
                            self.db.delete(&key)?;
                        }
                    }
                }
            }

            current_key = first_succ_id;
        }

        Ok(())
    }

    /// Synchronize our owned range against every successor.
    pub(crate) async fn run_local_maintenance(&self) -> Result<()> {
        if self.db.is_empty()? {
            return Ok(());
        }

        let min_key = self.state.min_key()?;
        let own_id = self.state.id().clone();
        for entry in self.state.successors().entries()? {
            if entry.id != own_id {
                self.synchronize(&entry, &min_key, &own_id).await?;
            }
        }
        Ok(())
    }
}
