//! Sessions against honest peers

use crate::harness::{config, peer, settle, TestNode};
use assert_matches::assert_matches;
use fbc_config::SyncMode;
use fbc_interfaces::{
    provider::ChainStore,
    sync::SyncStateProvider,
    test_utils::{TestChain, TestState},
};
use fbc_network::{
    test_utils::{PeerConfig, TEST_PROTOCOL_VERSION},
    NetworkEvent, Status,
};
use fbc_primitives::U256;
use fbc_sync::{SessionState, SyncError, SyncEvent};
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn full_sync_reaches_the_best_peer() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(40, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    node.connect(1, PeerConfig::new(chain.clone())).await;
    node.connect(2, PeerConfig::new(chain.clone()).with_delay(Duration::from_millis(20))).await;

    let (started, outcome) = node.sync().await;
    assert_matches!(
        started,
        Some(SyncEvent::Started { mode: SyncMode::Full, target: 40, ancestor: 0, pivot: None, .. })
    );
    assert_eq!(outcome, SyncEvent::Done { head: 40, hash: chain.tip().hash() });
    assert_eq!(node.head(), chain.head());
    assert_eq!(
        node.store.canonical_chain(),
        chain.headers().map(|header| (header.number, header.hash())).collect::<Vec<_>>()
    );
    assert_eq!(node.executor.executed(), 40);

    let progress = node.handle.progress_stream().next().await.unwrap();
    assert_eq!(progress, node.handle.progress());
    assert_eq!(progress.state, SessionState::Done);
    assert!(!progress.state.is_active());
    assert_eq!((progress.starting_block, progress.highest_block), (0, 40));
    assert!(!node.handle.is_syncing());
}

#[tokio::test(start_paused = true)]
async fn fast_sync_pivots_below_the_target() {
    fbc_tracing::init_test_tracing();
    let long = Arc::new(TestChain::new(150, 1));
    let short = Arc::new(TestChain::new(100, 1));
    assert_eq!(short.tip().hash(), long.block(100).unwrap().hash());

    let mut node = TestNode::spawn(long.store(0), config());
    node.connect(1, PeerConfig::new(short)).await;
    node.connect(2, PeerConfig::new(long.clone())).await;
    node.connect(3, PeerConfig::new(long.clone())).await;

    let (started, outcome) = node.sync().await;
    assert_matches!(
        started,
        Some(SyncEvent::Started { mode: SyncMode::Fast, target: 150, pivot: Some(86), .. })
    );
    assert_eq!(outcome, SyncEvent::Done { head: 150, hash: long.tip().hash() });
    assert_eq!(node.head(), long.head());

    // only the blocks after the pivot are executed
    assert_eq!(node.executor.executed(), 64);
    let pivot = long.block(86).unwrap();
    let state = TestState::load(pivot.state_root, node.store.kv()).unwrap();
    assert_eq!(state.commit().0, pivot.state_root);
    assert!(node.handle.progress().known_states > 0);
}

#[tokio::test(start_paused = true)]
async fn reorgs_onto_a_heavier_fork() {
    fbc_tracing::init_test_tracing();
    let local = TestChain::new(60, 1);
    let remote = Arc::new(local.fork(40, 30, 2, 2));
    let mut node = TestNode::spawn(local.store(60), config());
    node.connect(1, PeerConfig::new(remote.clone())).await;

    let (started, outcome) = node.sync().await;
    assert_matches!(
        started,
        Some(SyncEvent::Started { mode: SyncMode::Full, target: 70, ancestor: 40, .. })
    );
    assert_eq!(outcome, SyncEvent::Done { head: 70, hash: remote.tip().hash() });
    assert_eq!(node.head(), remote.head());
    assert_eq!(node.store.canonical_hash(50).unwrap(), Some(remote.block(50).unwrap().hash()));
    assert_eq!(node.store.canonical_hash(40).unwrap(), Some(local.block(40).unwrap().hash()));
}

#[tokio::test(start_paused = true)]
async fn no_session_without_a_heavier_peer() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(20, 1));
    let mut node = TestNode::spawn(chain.store(20), config());
    node.connect(1, PeerConfig::new(chain.clone())).await;

    node.handle.start();
    settle().await;
    assert_matches!(node.events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(node.handle.progress().state, SessionState::Idle);
    assert_eq!(node.head(), chain.head());
    assert!(node.net.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_the_session() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(200, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    let delay = Duration::from_millis(500);
    node.connect(1, PeerConfig::new(chain.clone()).with_delay(delay)).await;
    node.connect(2, PeerConfig::new(chain.clone()).with_delay(delay)).await;

    node.handle.start();
    assert_matches!(node.events.recv().await, Ok(SyncEvent::Started { target: 200, .. }));
    assert!(node.handle.is_syncing());
    node.handle.cancel();

    let (_, outcome) = node.outcome().await;
    assert_eq!(outcome, SyncEvent::Failed { error: SyncError::Cancelled });
    assert_eq!(node.handle.progress().state, SessionState::Cancelled);
    assert!(!node.handle.is_syncing());
    assert!(node.head().number < 200);

    // the peers are kept and serve the next session
    assert!(node.net.is_connected(&peer(1)) && node.net.is_connected(&peer(2)));
    let (_, outcome) = node.sync().await;
    assert_eq!(outcome, SyncEvent::Done { head: 200, hash: chain.tip().hash() });
}

#[tokio::test(start_paused = true)]
async fn new_start_replaces_the_running_session() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(40, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    let delay = Duration::from_millis(100);
    node.connect(1, PeerConfig::new(chain.clone()).with_delay(delay)).await;

    node.handle.start();
    assert_matches!(node.next_event().await, SyncEvent::Started { target: 40, .. });
    node.handle.start();

    // the first session is cleaned up before the second one starts
    let (started, outcome) = node.outcome().await;
    assert_eq!(started, None);
    assert_eq!(outcome, SyncEvent::Failed { error: SyncError::Cancelled });

    let (started, outcome) = node.outcome().await;
    assert_matches!(started, Some(SyncEvent::Started { target: 40, .. }));
    assert_eq!(outcome, SyncEvent::Done { head: 40, hash: chain.tip().hash() });
    assert_eq!(node.head(), chain.head());
    assert_eq!(node.handle.progress().state, SessionState::Done);
}

#[tokio::test(start_paused = true)]
async fn heavier_head_restarts_the_session() {
    fbc_tracing::init_test_tracing();
    let short = Arc::new(TestChain::new(40, 1));
    let long = Arc::new(TestChain::new(60, 1));
    let mut node = TestNode::spawn(short.store(0), config());
    let delay = Duration::from_millis(100);
    let peer_id = node.connect(1, PeerConfig::new(short.clone()).with_delay(delay)).await;

    node.handle.start();
    assert_matches!(node.next_event().await, SyncEvent::Started { target: 40, .. });

    // the peer extends its chain and propagates the new tip
    node.net.set_chain(&peer_id, long.clone());
    node.net.propagate(peer_id, long.tip().clone(), long.head().total_difficulty);

    let (_, outcome) = node.outcome().await;
    assert_eq!(outcome, SyncEvent::Failed { error: SyncError::Cancelled });
    let (started, outcome) = node.outcome().await;
    assert_matches!(started, Some(SyncEvent::Started { target: 59, .. }));
    assert_matches!(outcome, SyncEvent::Done { head, .. } if head >= 59);
    assert_eq!(node.store.canonical_hash(59).unwrap(), Some(long.block(59).unwrap().hash()));
}

#[tokio::test(start_paused = true)]
async fn peer_on_our_head_starts_no_session() {
    fbc_tracing::init_test_tracing();
    let chain = TestChain::new(20, 1);
    let mut node = TestNode::spawn(chain.store(20), config());
    let local = node.head();

    // claims more work on top of the very block we have
    node.net.emit(NetworkEvent::SessionEstablished {
        peer_id: peer(1),
        status: Status {
            version: TEST_PROTOCOL_VERSION,
            total_difficulty: local.total_difficulty + U256::from(1),
            head: local.hash,
            genesis: chain.genesis().hash(),
        },
    });
    settle().await;

    node.handle.start();
    settle().await;
    assert_matches!(node.events.try_recv(), Err(TryRecvError::Empty));
    assert!(node.net.requests().is_empty());
    assert_eq!(node.handle.progress().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn master_is_the_heaviest_peer() {
    fbc_tracing::init_test_tracing();
    let light = Arc::new(TestChain::new(40, 1));
    let heavy = Arc::new(light.fork(20, 25, 2, 3));
    let mut node = TestNode::spawn(light.store(0), config());
    node.connect(1, PeerConfig::new(light.clone())).await;
    let master = node.connect(2, PeerConfig::new(heavy.clone())).await;
    node.connect(3, PeerConfig::new(light.clone())).await;

    let (started, outcome) = node.sync().await;
    assert_matches!(started, Some(SyncEvent::Started { target: 45, .. }));
    assert_eq!(outcome, SyncEvent::Done { head: 45, hash: heavy.tip().hash() });
    assert_eq!(node.head(), heavy.head());

    // the lighter peers miss the anchors above the fork without blaming the master
    assert!(node.net.is_connected(&master));
    assert!(node.net.disconnected().is_empty());
}
