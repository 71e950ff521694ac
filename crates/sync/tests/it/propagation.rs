//! Propagated blocks between sessions

use crate::harness::{config, settle, wait_for, TestNode};
use assert_matches::assert_matches;
use fbc_config::SyncMode;
use fbc_interfaces::test_utils::TestChain;
use fbc_network::test_utils::PeerConfig;
use fbc_sync::SyncEvent;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn propagated_child_of_the_head_is_imported() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(30, 1));
    let mut node = TestNode::spawn(chain.store(20), config());
    let peer_id = node.connect(1, PeerConfig::new(Arc::new(TestChain::new(21, 1)))).await;

    let block = chain.block(21).unwrap().clone();
    node.net.propagate(peer_id, block, chain.total_difficulty(21).unwrap());
    wait_for(|| node.head().number == 21).await;

    assert_eq!(node.head().hash, chain.block(21).unwrap().hash());
    assert_eq!(node.executor.executed(), 1);
    // the peer's head is no better than ours now, so no session is started
    settle().await;
    assert_matches!(node.events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn announcement_with_unreachable_ancestry_is_discarded() {
    fbc_tracing::init_test_tracing();
    let chain = TestChain::new(20, 1);
    let fork = Arc::new(chain.fork(0, 40, 7, 1));
    let mut node = TestNode::spawn(chain.store(20), config());
    let peer_id = node.connect(1, PeerConfig::new(fork.clone())).await;

    node.net.announce(peer_id, fork.block(22).unwrap());
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(node.head(), chain.head());
    assert_eq!(node.executor.executed(), 0);
    assert!(node.net.is_connected(&peer_id));
    assert_matches!(node.events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn propagated_distant_head_starts_a_session() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(80, 1));
    let mut node = TestNode::spawn(chain.store(20), config());
    let peer_id = node.connect(1, PeerConfig::new(Arc::new(TestChain::new(20, 1)))).await;

    // the peer catches up and pushes a block far beyond the fetcher's reach
    node.net.set_chain(&peer_id, chain.clone());
    node.net.propagate(peer_id, chain.tip().clone(), chain.head().total_difficulty);

    let (started, outcome) = node.outcome().await;
    assert_matches!(
        started,
        Some(SyncEvent::Started { mode: SyncMode::Full, target: 79, ancestor: 20, .. })
    );
    assert_eq!(outcome, SyncEvent::Done { head: 79, hash: chain.block(79).unwrap().hash() });
}
