//! Chord ring state and protocol.
//!
//! [`ChordState`] owns one peer's view of the ring: its id, owned range,
//! predecessor pointer, finger table and successor list, together with the
//! join/leave/notify/stabilize/rectify flows that keep that view
//! converging. The key/value services compose it with a [`StoreAdapter`]
//! that decides what happens to stored data when ownership moves.
//!
//! Every mutable aggregate has its own lock, held only for one read or
//! write primitive and never across a network call. Compound flows like
//! stabilize are therefore not serializable; the ring invariants, not a
//! global lock, make them converge.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::RwLock;

use crate::consts::RING_BITS;
use crate::dht::finger::Finger;
use crate::dht::finger::FingerTable;
use crate::dht::successor::SuccessorList;
use crate::dht::Key;
use crate::dht::RemotePeer;
use crate::error::Error;
use crate::error::Result;
use crate::rpc;
use crate::rpc::GetSuccRequest;
use crate::rpc::JoinRequest;
use crate::rpc::JoinResponse;
use crate::rpc::KeyMap;
use crate::rpc::LeaveRequest;
use crate::rpc::NotifyRequest;
use crate::rpc::NotifyResponse;
use crate::rpc::RectifyRequest;
use crate::rpc::Request;

/// What the ring protocol needs from the service's database when key
/// ownership moves between peers.
///
/// The single-successor store hands keys over; the fragment store keeps
/// them where they are, since replication already covers the new owner and
/// global maintenance re-homes anything misplaced.
pub trait StoreAdapter: Send + Sync {
    /// Does this store move keys to a new predecessor or a leave target?
    fn transfers_keys(&self) -> bool;

    /// Remove and return every pair on the clockwise arc `[lo, hi]`.
    fn drain_range(&self, lo: &Key, hi: &Key) -> Result<KeyMap>;

    /// Every pair the peer holds, for a graceful leave.
    fn export_all(&self) -> Result<KeyMap>;

    /// Take ownership of pairs handed over by another peer.
    fn absorb(&self, keys: &KeyMap) -> Result<()>;
}

/// One peer's ring state and protocol implementation.
pub struct ChordState {
    id: Key,
    addr: String,
    port: u16,
    num_succs: usize,
    min_key: RwLock<Key>,
    predecessor: RwLock<Option<RemotePeer>>,
    finger: FingerTable,
    successors: SuccessorList,
    store: Arc<dyn StoreAdapter>,
}

impl ChordState {
    /// Build the state of a peer listening at `addr:port`. The ring id is
    /// the hash of `addr:port`, so it is stable across restarts of the
    /// same endpoint.
    pub fn new(addr: &str, port: u16, num_succs: usize, store: Arc<dyn StoreAdapter>) -> Self {
        let id = Key::hash(&format!("{}:{}", addr, port));
        Self {
            min_key: RwLock::new(id.clone()),
            predecessor: RwLock::new(None),
            finger: FingerTable::new(id.clone()),
            successors: SuccessorList::new(id.clone(), num_succs),
            id,
            addr: addr.to_string(),
            port,
            num_succs,
            store,
        }
    }

    /// Ring id of this peer.
    pub fn id(&self) -> &Key {
        &self.id
    }

    /// Successor list capacity.
    pub fn num_succs(&self) -> usize {
        self.num_succs
    }

    /// Finger table of this peer.
    pub fn finger(&self) -> &FingerTable {
        &self.finger
    }

    /// Successor list of this peer.
    pub fn successors(&self) -> &SuccessorList {
        &self.successors
    }

    /// Smallest key this peer currently owns.
    pub fn min_key(&self) -> Result<Key> {
        Ok(self
            .min_key
            .read()
            .map_err(|_| Error::RingStateLockFailed)?
            .clone())
    }

    fn set_min_key(&self, key: Key) -> Result<()> {
        *self
            .min_key
            .write()
            .map_err(|_| Error::RingStateLockFailed)? = key;
        Ok(())
    }

    /// Current predecessor pointer.
    pub fn predecessor(&self) -> Result<Option<RemotePeer>> {
        Ok(self
            .predecessor
            .read()
            .map_err(|_| Error::RingStateLockFailed)?
            .clone())
    }

    fn set_predecessor(&self, peer: Option<RemotePeer>) -> Result<()> {
        *self
            .predecessor
            .write()
            .map_err(|_| Error::RingStateLockFailed)? = peer;
        Ok(())
    }

    /// Does this peer own `key`, i.e. is `key` in `[min_key, id]`?
    pub fn stored_locally(&self, key: &Key) -> Result<bool> {
        Ok(key.in_between(&self.min_key()?, &self.id, true))
    }

    /// This peer described as a [`RemotePeer`].
    pub fn to_remote_peer(&self) -> Result<RemotePeer> {
        Ok(RemotePeer::new(
            self.id.clone(),
            self.min_key()?,
            self.addr.clone(),
            self.port,
        ))
    }

    fn short_id(&self) -> String {
        self.id.to_hex().chars().take(8).collect()
    }

    /// First peer in the ring: it owns the whole keyspace and is its own
    /// predecessor until someone joins.
    pub fn start_chord(&self) -> Result<()> {
        self.set_min_key(&self.id + 1)?;
        self.set_predecessor(Some(self.to_remote_peer()?))?;
        tracing::info!(peer = %self.short_id(), "started a new ring");
        Ok(())
    }

    /// Enter an existing ring through a gateway peer.
    pub async fn join(&self, gateway_addr: &str, gateway_port: u16) -> Result<()> {
        tracing::info!(
            peer = %self.short_id(),
            gateway = %format!("{}:{}", gateway_addr, gateway_port),
            "joining ring"
        );

        let join_req = Request::Join(JoinRequest {
            new_peer: self.to_remote_peer()?,
        });
        let resp: JoinResponse =
            rpc::client::call(gateway_addr, gateway_port, &join_req).await?;

        self.set_predecessor(Some(resp.predecessor.clone()))?;
        self.set_min_key(&resp.predecessor.id + 1)?;

        self.populate_finger_table(true).await?;

        let succ = self.finger.get_nth(0)?;
        self.notify(&succ).await?;

        // In large rings it pays to notify the whole predecessor window up
        // front instead of waiting for stabilization to find us.
        if self.num_succs > 10 {
            for pred in self.get_n_predecessors(&self.id, self.num_succs).await? {
                self.notify(&pred).await?;
            }
            let succs = self
                .get_n_successors(&(&self.id + 1), self.num_succs)
                .await?;
            self.successors.populate(succs)?;
        }

        self.fix_other_fingers(&self.id.clone()).await?;
        Ok(())
    }

    /// Leave gracefully: hand our keys to the ring and tell the peers that
    /// point at us. Best effort; the caller shuts the peer down afterwards
    /// whether or not anyone acknowledged.
    pub async fn leave(&self) -> Result<()> {
        tracing::info!(peer = %self.short_id(), "leaving ring");

        let predecessor = self
            .predecessor()?
            .unwrap_or(self.to_remote_peer()?);
        let new_succ = self.finger.get_nth(0).ok();

        let leave_req = Request::Leave(LeaveRequest {
            leaving_id: self.id.clone(),
            new_pred: predecessor,
            new_min: self.min_key()?,
            keys_to_absorb: self.store.export_all()?,
            new_succ: new_succ.clone(),
        });

        for pred in self.get_n_predecessors(&self.id, self.num_succs).await? {
            if let Err(e) = pred.send_request(&leave_req).await {
                tracing::warn!(peer = %self.short_id(), target = %pred, error = %e,
                    "predecessor did not acknowledge leave");
            }
        }

        if let Some(succ) = new_succ {
            if succ.id != self.id && succ.is_alive().await {
                if let Err(e) = succ.send_request(&leave_req).await {
                    // Rejection is advisory; we shut down regardless.
                    tracing::warn!(peer = %self.short_id(), target = %succ, error = %e,
                        "successor did not acknowledge leave");
                }
            }
        }

        Ok(())
    }

    /// Handle a JOIN from a prospective peer: answer with its predecessor
    /// and point our own tables at the joiner right away, which saves the
    /// next stabilize cycle some work.
    pub async fn handle_join(&self, new_peer: RemotePeer) -> Result<JoinResponse> {
        tracing::debug!(peer = %self.short_id(), joiner = %new_peer, "handling join");

        let predecessor = self.get_predecessor(&new_peer.id).await?;
        self.finger.adjust_fingers(&new_peer)?;
        self.successors.insert(&new_peer)?;

        Ok(JoinResponse { predecessor })
    }

    /// Tell a peer we may be its predecessor or one of its successors, and
    /// absorb whatever keys it decides are now ours.
    pub async fn notify(&self, peer: &RemotePeer) -> Result<()> {
        let resp: NotifyResponse = peer
            .call(&Request::Notify(NotifyRequest {
                new_peer: self.to_remote_peer()?,
            }))
            .await?;

        if !resp.keys_to_absorb.is_empty() {
            self.store.absorb(&resp.keys_to_absorb)?;
        }
        Ok(())
    }

    /// Handle a NOTIFY from another peer.
    pub async fn handle_notify(&self, new_peer: RemotePeer) -> Result<NotifyResponse> {
        tracing::debug!(peer = %self.short_id(), notifier = %new_peer, "handling notify");

        if new_peer.id == self.id {
            return Ok(NotifyResponse::default());
        }

        let predecessor = self.predecessor()?;

        // A dead predecessor means the notifier is our best candidate; take
        // it and then tell the ring about the failure.
        if let Some(old_pred) = &predecessor {
            if old_pred.id != self.id && !old_pred.is_alive().await {
                let resp = self.handle_notify_from_pred(&new_peer).await?;
                self.handle_pred_failure(old_pred).await?;
                return Ok(resp);
            }
        }

        self.finger.adjust_fingers(&new_peer)?;
        self.successors.insert(&new_peer)?;

        let peer_is_pred = match &predecessor {
            None => true,
            // A predecessor pointing at ourselves means we have not seen
            // any other peer yet.
            Some(p) => p.id == self.id || new_peer.id.in_between(&p.id, &self.id, false),
        };

        if peer_is_pred {
            return self.handle_notify_from_pred(&new_peer).await;
        }

        // A peer that started a ring alone has an empty finger table until
        // a second peer shows up.
        if self.finger.is_empty()? {
            self.populate_finger_table(true).await?;
        }

        Ok(NotifyResponse::default())
    }

    /// The notifier is our rightful predecessor: hand it the keys on
    /// `[min_key, notifier.id]` (if this store transfers keys), adopt it,
    /// and shrink our owned range.
    async fn handle_notify_from_pred(&self, new_pred: &RemotePeer) -> Result<NotifyResponse> {
        let min_key = self.min_key()?;
        let keys_to_absorb = self.store.drain_range(&min_key, &new_pred.id)?;

        self.finger.adjust_fingers(new_pred)?;
        self.set_predecessor(Some(new_pred.clone()))?;
        self.set_min_key(&new_pred.id + 1)?;

        tracing::debug!(peer = %self.short_id(), pred = %new_pred, "adopted new predecessor");

        if !self.store.transfers_keys() && self.successors.is_empty()? {
            let succs = self
                .get_n_successors(&(&self.id + 1), self.num_succs)
                .await?;
            self.successors.populate(succs)?;
        }

        Ok(NotifyResponse { keys_to_absorb })
    }

    /// Handle a LEAVE notice from a departing peer.
    pub async fn handle_leave(&self, req: LeaveRequest) -> Result<()> {
        tracing::debug!(peer = %self.short_id(), leaver = %req.leaving_id, "handling leave");

        if let Some(pred) = self.predecessor()? {
            if req.leaving_id == pred.id {
                let old_pred_id = pred.id.clone();
                self.set_predecessor(Some(req.new_pred.clone()))?;
                self.set_min_key(req.new_min.clone())?;
                self.fix_other_fingers(&old_pred_id).await?;
                self.store.absorb(&req.keys_to_absorb)?;
            }
        }

        self.successors.delete(&req.leaving_id)?;
        if self.successors.is_empty()? {
            let succs = self
                .get_n_successors(&(&self.id + 1), self.num_succs)
                .await?;
            self.successors.populate(succs)?;
        }

        if let Some(new_succ) = &req.new_succ {
            if new_succ.id != req.leaving_id {
                self.finger.adjust_fingers(new_succ)?;
            }
        }

        Ok(())
    }

    /// Handle a RECTIFY: purge the failed peer and point at the
    /// originator instead, then notify it so it learns about us.
    pub async fn handle_rectify(&self, req: RectifyRequest) -> Result<()> {
        if req.originator.id == self.id {
            return Ok(());
        }

        tracing::debug!(peer = %self.short_id(), failed = %req.failed_node,
            "handling rectify");

        self.successors.delete(&req.failed_node.id)?;
        self.finger
            .replace_dead_peer(&req.failed_node, &req.originator)?;
        self.notify(&req.originator).await?;
        Ok(())
    }

    /// The peer succeeding `key` on the ring.
    pub async fn get_successor(&self, key: &Key) -> Result<RemotePeer> {
        if self.stored_locally(key)? {
            return self.to_remote_peer();
        }

        let resp = self
            .forward_request(
                key,
                &Request::GetSucc(GetSuccRequest { key: key.clone() }),
            )
            .await?;
        serde_json::from_value(resp).map_err(Error::Deserialize)
    }

    /// The peer preceding `key` on the ring.
    pub async fn get_predecessor(&self, key: &Key) -> Result<RemotePeer> {
        let predecessor = match self.predecessor()? {
            // Alone in the ring; everything precedes us.
            None => return self.to_remote_peer(),
            Some(p) => p,
        };

        if self.stored_locally(key)? {
            return Ok(predecessor);
        }

        // The successor list often answers quicker than a finger walk.
        if let Some(succ) = self.successors.lookup(key)? {
            if let Ok(pred_of_succ) = succ.get_pred().await {
                if key.in_between(&pred_of_succ.id, &succ.id, true) {
                    return Ok(pred_of_succ);
                }
            }
        }

        let resp = self
            .forward_request(
                key,
                &Request::GetPred(rpc::GetPredRequest { key: key.clone() }),
            )
            .await?;
        serde_json::from_value(resp).map_err(Error::Deserialize)
    }

    /// The first `n` distinct peers succeeding `key`, stopping early when
    /// the walk loops back around the ring.
    pub async fn get_n_successors(&self, key: &Key, n: usize) -> Result<Vec<RemotePeer>> {
        let mut found = Vec::new();
        let mut seen: BTreeSet<Key> = BTreeSet::new();
        let mut previous = key - 1u64;

        for _ in 0..n {
            let succ = self.get_successor(&(&previous + 1)).await?;
            if !seen.insert(succ.id.clone()) {
                break;
            }
            previous = succ.id.clone();
            found.push(succ);
        }
        Ok(found)
    }

    /// The first `n` distinct peers preceding `key`, counter-clockwise.
    pub async fn get_n_predecessors(&self, key: &Key, n: usize) -> Result<Vec<RemotePeer>> {
        let mut found = Vec::new();
        let mut seen: BTreeSet<Key> = BTreeSet::new();
        let mut previous = key.clone();

        for _ in 0..n {
            let pred = self.get_predecessor(&(&previous - 1)).await?;
            if pred.id == *key || !seen.insert(pred.id.clone()) {
                break;
            }
            previous = pred.id.clone();
            found.push(pred);
        }
        Ok(found)
    }

    /// Route a request towards the peer owning `key`: finger table first,
    /// then the successor list, then the first living successor.
    pub async fn forward_request(
        &self,
        key: &Key,
        request: &Request,
    ) -> Result<serde_json::Value> {
        let mut target = self.finger.lookup(key)?;

        if target.id == self.id {
            // A finger pointing at ourselves usually belongs to a
            // predecessor that absorbed part of our old range.
            if let Some(pred) = self.predecessor()? {
                if pred.id != self.id && pred.is_alive().await {
                    target = pred;
                }
            }
        } else if !target.is_alive().await {
            target = match self.successors.lookup_living(key).await? {
                Some(peer) => peer,
                None => self
                    .successors
                    .first_living()
                    .await?
                    .ok_or(Error::NoRoute)?,
            };
        }

        target.send_request(request).await
    }

    /// One stabilization round.
    pub async fn stabilize(&self) -> Result<()> {
        tracing::debug!(peer = %self.short_id(), "running stabilize");

        // A dead predecessor leaves our range ownerless; claim it and tell
        // the ring.
        if let Some(pred) = self.predecessor()? {
            if pred.id != self.id && !pred.is_alive().await {
                self.handle_pred_failure(&pred).await?;
            }
        }

        if self.successors.is_empty()? {
            let succs = self
                .get_n_successors(&(&self.id + 1), self.num_succs)
                .await?;
            self.successors.populate(succs)?;
            self.populate_finger_table(false).await?;
            return Ok(());
        }

        // Drop dead peers off the front of the successor list.
        let immediate = loop {
            match self.successors.nth(0)? {
                None => return Ok(()),
                Some(succ) => {
                    if succ.id == self.id || succ.is_alive().await {
                        break succ;
                    }
                    self.successors.delete(&succ.id)?;
                }
            }
        };

        // If a peer slipped in between us and our successor, or our
        // successor's predecessor died, re-assert ourselves.
        let pred_of_succ = immediate.get_pred().await?;
        let we_are_pred = self
            .id
            .in_between(&pred_of_succ.id, &immediate.id, true);
        if we_are_pred || !pred_of_succ.is_alive().await {
            self.notify(&immediate).await?;
        }

        self.update_succ_list().await?;
        self.populate_finger_table(false).await?;
        Ok(())
    }

    /// Walk predecessors between consecutive successor-list entries and
    /// insert any live peer we did not know about; then top the list up to
    /// capacity from beyond its last entry.
    pub(crate) async fn update_succ_list(&self) -> Result<()> {
        let old_list = self.successors.entries()?;
        let mut previous_succ_id = self.id.clone();

        for nth_entry in &old_list {
            let mut last_entry = nth_entry.clone();
            loop {
                let pred = match last_entry.get_pred().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                if pred.id == previous_succ_id || pred.id == self.id || pred.id == last_entry.id
                {
                    break;
                }
                if pred.is_alive().await {
                    self.successors.insert(&pred)?;
                }
                last_entry = pred;
            }
            previous_succ_id = nth_entry.id.clone();
        }

        let len = self.successors.len()?;
        if len > 0 && len < self.num_succs {
            if let Some(last_succ) = self.successors.nth(len - 1)? {
                let deficit = self.num_succs - len;
                let extra = self
                    .get_n_successors(&(&last_succ.id + 1), deficit)
                    .await?;
                for peer in extra {
                    if peer.id != self.id {
                        self.successors.insert(&peer)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Fill in or refresh the finger table. In initialization mode each
    /// range's successor is looked up through the previous entry (or the
    /// predecessor for entry zero); in incremental mode existing entries
    /// are edited in place.
    pub async fn populate_finger_table(&self, initialize: bool) -> Result<()> {
        for i in 0..RING_BITS {
            let (lower_bound, upper_bound) = self.finger.nth_range(i);

            if initialize {
                if self.stored_locally(&lower_bound)? {
                    self.finger.add_finger(Finger {
                        lower_bound,
                        upper_bound,
                        successor: self.to_remote_peer()?,
                    })?;
                    continue;
                }

                let peer_to_query = if i == 0 {
                    self.predecessor()?.ok_or(Error::NoRoute)?
                } else {
                    self.finger.get_nth(i - 1)?
                };
                let successor: RemotePeer = peer_to_query
                    .call(&Request::GetSucc(GetSuccRequest {
                        key: lower_bound.clone(),
                    }))
                    .await?;
                self.finger.add_finger(Finger {
                    lower_bound,
                    upper_bound,
                    successor,
                })?;
            } else if i == 0 {
                let successor = self.get_successor(&lower_bound).await?;
                self.finger.edit_nth(0, successor)?;
            } else {
                // The closest preceding peer we know for this range is the
                // previous entry; ask it directly.
                let previous = self.finger.get_nth(i - 1)?;
                let successor: RemotePeer = previous
                    .call(&Request::GetSucc(GetSuccRequest {
                        key: lower_bound.clone(),
                    }))
                    .await?;
                self.finger.edit_nth(i, successor)?;
            }
        }
        Ok(())
    }

    /// After joining (or absorbing a failed predecessor's range), the
    /// predecessors of `starting_key - 2^i` hold finger entries that
    /// should now point here. Notify each until the walk reaches our own
    /// arc.
    pub async fn fix_other_fingers(&self, starting_key: &Key) -> Result<()> {
        let mut former_peer: Option<RemotePeer> = None;

        for i in 1..=RING_BITS {
            let target = starting_key - &Key::two_pow(i - 1);
            let peer = self.get_predecessor(&target).await?;

            if former_peer.as_ref() == Some(&peer) {
                continue;
            }
            former_peer = Some(peer.clone());

            // Reaching our own arc means the rest of the walk stays inside
            // it; nothing left to fix.
            if peer.id == self.id {
                break;
            }

            if peer.is_alive().await {
                self.notify(&peer).await?;
            }
        }
        Ok(())
    }

    /// Our predecessor stopped answering: its range falls to us until a
    /// new predecessor shows up, and the ring needs to purge it.
    async fn handle_pred_failure(&self, old_pred: &RemotePeer) -> Result<()> {
        tracing::info!(peer = %self.short_id(), failed = %old_pred,
            "predecessor failed, rectifying");
        self.finger.adjust_fingers(&self.to_remote_peer()?)?;
        self.rectify(old_pred).await
    }

    /// Tell the predecessors of `failed - 2^i` that `failed` is gone and
    /// that we noticed, so they rewire and notify us back.
    pub async fn rectify(&self, failed: &RemotePeer) -> Result<()> {
        if failed.is_alive().await {
            return Ok(());
        }

        let rectify_req = Request::Rectify(RectifyRequest {
            failed_node: failed.clone(),
            originator: self.to_remote_peer()?,
        });

        let mut former_peer: Option<RemotePeer> = None;
        for i in 1..=RING_BITS {
            let target = &failed.id - &Key::two_pow(i - 1);
            let peer = self.get_predecessor(&target).await?;

            if former_peer.as_ref() == Some(&peer) {
                continue;
            }
            former_peer = Some(peer.clone());

            if peer.id == self.id {
                break;
            }

            if peer.is_alive().await {
                peer.send_request(&rectify_req).await?;
            }
        }
        Ok(())
    }
}
