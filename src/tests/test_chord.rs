//! Ring formation and single-successor store scenarios.

use super::*;

#[tokio::test(flavor = "multi_thread")]
async fn test_join_assigns_predecessors() {
    let peers = spawn_chord_ring(22000, 5, fast_config(3)).await;
    let ids: Vec<Key> = peers.iter().map(|p| p.state().id().clone()).collect();

    for peer in &peers {
        let id = peer.state().id();
        let pred = peer
            .state()
            .predecessor()
            .unwrap()
            .expect("every peer has a predecessor after quiescence");

        let expected = expected_predecessor(&ids, id);
        assert_eq!(pred.id, expected, "predecessor of {}", id);
        assert_eq!(
            peer.state().min_key().unwrap(),
            &expected + 1,
            "min_key of {}",
            id
        );
    }

    for peer in &peers {
        peer.fail().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_and_read_across_peers() {
    let peers = spawn_chord_ring(22100, 6, fast_config(3)).await;

    for i in 0..100 {
        let key = i.to_string();
        peers[i % peers.len()].create(&key, &key).await.unwrap();
    }

    for peer in &peers {
        for i in 0..100 {
            let key = i.to_string();
            assert_eq!(
                peer.read(&key).await.unwrap(),
                key,
                "key {} read from {}",
                key,
                peer.state().id()
            );
        }
    }

    for peer in &peers {
        peer.fail().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_leave_transfers_keys() {
    let peers = spawn_chord_ring(22200, 6, fast_config(3)).await;

    for i in 0..40 {
        let key = i.to_string();
        peers[i % peers.len()].create(&key, &key).await.unwrap();
    }

    // Everyone but the last peer leaves; the keys chase the departures
    // around the ring and pile up on the survivor.
    for peer in &peers[..5] {
        peer.leave().await.unwrap();
        settle(1000).await;
    }

    let survivor = &peers[5];
    settle(1000).await;

    assert_eq!(survivor.db().len().unwrap(), 40);
    for i in 0..40 {
        let key = i.to_string();
        assert_eq!(survivor.read(&key).await.unwrap(), key, "key {}", key);
    }

    survivor.fail().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_hands_over_keys() {
    // One peer owns everything; a joiner must receive exactly the keys on
    // its new arc.
    let config = fast_config(3);
    let a = ChordNode::start(LOCALHOST, 22400, config.clone())
        .await
        .unwrap();
    a.start_chord().await.unwrap();

    for i in 0..30 {
        let key = i.to_string();
        a.create(&key, &key).await.unwrap();
    }
    assert_eq!(a.db().len().unwrap(), 30);

    let b = ChordNode::start(LOCALHOST, 22401, config).await.unwrap();
    b.join(LOCALHOST, 22400).await.unwrap();
    settle(2000).await;

    let a_id = a.state().id().clone();
    let b_id = b.state().id().clone();
    let b_min = &a_id + 1;

    for i in 0..30 {
        let key = Key::hash(&i.to_string());
        let on_a = a.db().contains(&key).unwrap();
        let on_b = b.db().contains(&key).unwrap();
        assert!(on_a != on_b, "key {} must live on exactly one peer", i);
        assert_eq!(
            on_b,
            key.in_between(&b_min, &b_id, true),
            "key {} placement",
            i
        );
    }

    // Both peers still serve every key.
    for i in 0..30 {
        let key = i.to_string();
        assert_eq!(a.read(&key).await.unwrap(), key);
        assert_eq!(b.read(&key).await.unwrap(), key);
    }

    a.fail().await.unwrap();
    b.fail().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_n_successors_stops_after_looping() {
    let peers = spawn_chord_ring(22500, 3, fast_config(3)).await;
    let ids: Vec<Key> = peers.iter().map(|p| p.state().id().clone()).collect();

    let state = peers[0].state();
    let walked = state
        .get_n_successors(&(state.id() + 1u64), 10)
        .await
        .unwrap();

    // The walk visits each peer once, ending with ourselves, and stops
    // instead of cycling.
    assert_eq!(walked.len(), 3);
    let walked_ids: Vec<Key> = walked.iter().map(|p| p.id.clone()).collect();
    let mut expected = expected_successors(&ids, state.id(), 2);
    expected.push(state.id().clone());
    assert_eq!(walked_ids, expected);

    for peer in &peers {
        peer.fail().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_upload_download() {
    let peer = ChordNode::start(LOCALHOST, 22600, fast_config(3))
        .await
        .unwrap();
    peer.start_chord().await.unwrap();

    let dir = std::env::temp_dir();
    let input = dir.join("ringstore-upload.txt");
    let output = dir.join("ringstore-download.txt");
    let contents = "line one\nline two\n";
    tokio::fs::write(&input, contents).await.unwrap();

    peer.upload_file(input.to_str().unwrap()).await.unwrap();
    peer.download_file(input.to_str().unwrap(), output.to_str().unwrap())
        .await
        .unwrap();

    assert_eq!(
        tokio::fs::read_to_string(&output).await.unwrap(),
        contents
    );

    tokio::fs::remove_file(&input).await.ok();
    tokio::fs::remove_file(&output).await.ok();
    peer.fail().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fail_and_self_heal() {
    let peers = spawn_chord_ring(22300, 6, fast_config(3)).await;

    peers[0].fail().await.unwrap();
    peers[1].fail().await.unwrap();

    // Let stabilization notice the failures and close the ring again.
    settle(8000).await;

    let survivors: Vec<_> = peers[2..].iter().collect();
    let live_ids: Vec<Key> = survivors
        .iter()
        .map(|p| p.state().id().clone())
        .collect();

    for peer in &survivors {
        let id = peer.state().id();
        let pred = peer
            .state()
            .predecessor()
            .unwrap()
            .expect("predecessor set after healing");

        let expected_pred = expected_predecessor(&live_ids, id);
        assert_eq!(pred.id, expected_pred, "predecessor of {}", id);
        assert_eq!(
            peer.state().min_key().unwrap(),
            &expected_pred + 1,
            "min_key of {}",
            id
        );

        let succs = peer.state().successors().entries().unwrap();
        let succ_ids: Vec<Key> = succs.iter().take(3).map(|p| p.id.clone()).collect();
        assert_eq!(
            succ_ids,
            expected_successors(&live_ids, id, 3),
            "successor list of {}",
            id
        );
    }

    for peer in &survivors {
        peer.fail().await.unwrap();
    }
}
