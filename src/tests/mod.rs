//! Multi-peer scenarios over real localhost TCP.
//!
//! Each test builds its ring on a distinct port range so the scenarios can
//! run in parallel. Stabilization intervals are shrunk so rings converge
//! in seconds instead of minutes.

use std::time::Duration;

use crate::dht::Key;
use crate::node::ChordNode;
use crate::node::DhashNode;
use crate::node::PeerConfig;

mod test_chord;
mod test_maintenance;

pub const LOCALHOST: &str = "127.0.0.1";

/// A config that converges fast enough for tests.
pub fn fast_config(num_succs: usize) -> PeerConfig {
    PeerConfig {
        num_succs,
        stabilize_interval: Duration::from_millis(300),
        ..PeerConfig::default()
    }
}

/// A config whose maintenance loop effectively never fires, for
/// deterministic handler-level scenarios. Joins alone wire the ring up.
pub fn parked_config(num_succs: usize) -> PeerConfig {
    PeerConfig {
        num_succs,
        stabilize_interval: Duration::from_secs(3600),
        ..PeerConfig::default()
    }
}

/// Like [`spawn_chord_ring`] but with maintenance parked; the ring state
/// is whatever the join flows produced.
pub async fn spawn_parked_chord_ring(
    base_port: u16,
    count: usize,
    num_succs: usize,
) -> Vec<ChordNode> {
    let config = parked_config(num_succs);
    let mut peers = Vec::with_capacity(count);

    let first = ChordNode::start(LOCALHOST, base_port, config.clone())
        .await
        .unwrap();
    first.start_chord().await.unwrap();
    peers.push(first);

    for i in 1..count {
        let peer = ChordNode::start(LOCALHOST, base_port + i as u16, config.clone())
            .await
            .unwrap();
        peer.join(LOCALHOST, base_port).await.unwrap();
        settle(200).await;
        peers.push(peer);
    }

    settle(200).await;
    peers
}

/// References to all peers other than `anchor`, in clockwise ring order
/// starting just after it.
pub fn peers_clockwise_of<'a>(anchor: &Key, peers: &'a [ChordNode]) -> Vec<&'a ChordNode> {
    let mut others: Vec<&ChordNode> = peers
        .iter()
        .filter(|p| p.state().id() != anchor)
        .collect();
    others.sort_by_key(|p| p.state().id() - anchor);
    others
}

pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Start one peer, then join the rest through it one at a time.
pub async fn spawn_chord_ring(
    base_port: u16,
    count: usize,
    config: PeerConfig,
) -> Vec<ChordNode> {
    let mut peers = Vec::with_capacity(count);

    let first = ChordNode::start(LOCALHOST, base_port, config.clone())
        .await
        .unwrap();
    first.start_chord().await.unwrap();
    peers.push(first);

    for i in 1..count {
        let peer = ChordNode::start(LOCALHOST, base_port + i as u16, config.clone())
            .await
            .unwrap();
        peer.join(LOCALHOST, base_port).await.unwrap();
        settle(800).await;
        peers.push(peer);
    }

    settle(2000).await;
    peers
}

/// Same as [`spawn_chord_ring`] for the replicated service.
pub async fn spawn_dhash_ring(
    base_port: u16,
    count: usize,
    config: PeerConfig,
) -> Vec<DhashNode> {
    let mut peers = Vec::with_capacity(count);

    let first = DhashNode::start(LOCALHOST, base_port, config.clone())
        .await
        .unwrap();
    first.start_chord().await.unwrap();
    peers.push(first);

    for i in 1..count {
        let peer = DhashNode::start(LOCALHOST, base_port + i as u16, config.clone())
            .await
            .unwrap();
        peer.join(LOCALHOST, base_port).await.unwrap();
        settle(800).await;
        peers.push(peer);
    }

    settle(2000).await;
    peers
}

/// The id preceding `id` in ring order over `ids`: the largest id below
/// it, wrapping to the overall largest.
pub fn expected_predecessor(ids: &[Key], id: &Key) -> Key {
    let mut sorted: Vec<Key> = ids.to_vec();
    sorted.sort();
    sorted
        .iter()
        .rev()
        .find(|other| *other < id)
        .unwrap_or_else(|| sorted.last().unwrap())
        .clone()
}

/// The ids following `id` in clockwise ring order over `ids`.
pub fn expected_successors(ids: &[Key], id: &Key, count: usize) -> Vec<Key> {
    let mut sorted: Vec<Key> = ids.to_vec();
    sorted.sort();
    let start = sorted
        .iter()
        .position(|other| other > id)
        .unwrap_or(0);

    let mut result = Vec::new();
    for offset in 0..count.min(sorted.len().saturating_sub(1)) {
        let candidate = &sorted[(start + offset) % sorted.len()];
        if candidate == id {
            break;
        }
        result.push(candidate.clone());
    }
    result
}

#[test]
fn test_expected_ring_helpers() {
    let ids: Vec<Key> = [10u64, 20, 30, 40].iter().map(|&v| Key::from(v)).collect();

    assert_eq!(expected_predecessor(&ids, &Key::from(20u64)), Key::from(10u64));
    // The smallest id wraps to the largest.
    assert_eq!(expected_predecessor(&ids, &Key::from(10u64)), Key::from(40u64));

    assert_eq!(
        expected_successors(&ids, &Key::from(30u64), 2),
        vec![Key::from(40u64), Key::from(10u64)]
    );
    assert_eq!(
        expected_successors(&ids, &Key::from(40u64), 3),
        vec![Key::from(10u64), Key::from(20u64), Key::from(30u64)]
    );
}
