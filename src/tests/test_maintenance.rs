//! Global and local maintenance scenarios, driven one pass at a time.

use super::*;
use crate::ida::Ida;
use crate::node::PeerConfig;

fn tiny_dhash_config() -> PeerConfig {
    PeerConfig {
        stabilize_interval: std::time::Duration::from_secs(3600),
        ida_n: 2,
        ida_m: 1,
        ida_p: 257,
        ..fast_config(2)
    }
}

/// The peers holding and not holding a key in a three-peer ring with two
/// fragments per value.
async fn split_ring_by_key<'a>(
    peers: &'a [DhashNode],
    key: &Key,
) -> (Vec<&'a DhashNode>, &'a DhashNode) {
    let holders = peers[0].state().get_n_successors(key, 2).await.unwrap();
    let holder_refs: Vec<&DhashNode> = holders
        .iter()
        .map(|h| {
            peers
                .iter()
                .find(|p| p.state().id() == &h.id)
                .expect("holder is a ring peer")
        })
        .collect();
    let outsider = peers
        .iter()
        .find(|p| !holders.iter().any(|h| &h.id == p.state().id()))
        .expect("one peer is not a holder");
    (holder_refs, outsider)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_global_maintenance_rehomes_misplaced_fragments() {
    let config = tiny_dhash_config();
    let peers = spawn_dhash_ring(26000, 3, config.clone()).await;

    let key = Key::hash("misplaced");
    let (holders, outsider) = split_ring_by_key(&peers, &key).await;

    // Plant a fragment on the one peer that should not hold it.
    let ida = Ida::new(config.ida_n, config.ida_m, config.ida_p).unwrap();
    let fragment = ida.encode_bytes(b"wandering value")[0].clone();
    outsider.db().insert(key.clone(), fragment).unwrap();

    outsider.inner.run_global_maintenance().await.unwrap();

    // The fragment moved to the key's first successor and is gone here.
    assert!(!outsider.db().contains(&key).unwrap());
    assert!(holders[0].db().contains(&key).unwrap());
    assert_eq!(
        holders[0].read_hashed(&key).await.unwrap(),
        b"wandering value"
    );

    for peer in &peers {
        peer.fail().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_global_maintenance_leaves_owned_fragments_alone() {
    let config = tiny_dhash_config();
    let peers = spawn_dhash_ring(26100, 3, config.clone()).await;

    let key = Key::hash("well placed");
    let (holders, _) = split_ring_by_key(&peers, &key).await;

    let ida = Ida::new(config.ida_n, config.ida_m, config.ida_p).unwrap();
    let fragment = ida.encode_bytes(b"settled value")[0].clone();
    holders[0].db().insert(key.clone(), fragment).unwrap();

    holders[0].inner.run_global_maintenance().await.unwrap();
    assert!(holders[0].db().contains(&key).unwrap());

    for peer in &peers {
        peer.fail().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_maintenance_repairs_missing_replicas() {
    let config = tiny_dhash_config();
    let peers = spawn_dhash_ring(26200, 3, config.clone()).await;

    let key = Key::hash("under replicated");
    let (holders, _) = split_ring_by_key(&peers, &key).await;
    let (first, second) = (holders[0], holders[1]);

    // Only the first holder has a fragment; the second should have one
    // too.
    let ida = Ida::new(config.ida_n, config.ida_m, config.ida_p).unwrap();
    let fragment = ida.encode_bytes(b"repaired value")[0].clone();
    first.db().insert(key.clone(), fragment).unwrap();

    // Make sure the under-replicated peer is in the holder's successor
    // list, so the sync pass reaches it.
    first
        .state()
        .successors()
        .insert(&second.state().to_remote_peer().unwrap())
        .unwrap();

    first.inner.run_local_maintenance().await.unwrap();

    assert!(second.db().contains(&key).unwrap());
    assert_eq!(
        second.read_hashed(&key).await.unwrap(),
        b"repaired value"
    );

    for peer in &peers {
        peer.fail().await.unwrap();
    }
}
