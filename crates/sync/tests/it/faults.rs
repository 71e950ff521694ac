//! Sessions against faulty peers

use crate::harness::{config, peer, settle, TestNode};
use assert_matches::assert_matches;
use fbc_config::SyncMode;
use fbc_interfaces::{
    provider::{ChainStore, KeyValueStore},
    test_utils::TestChain,
};
use fbc_network::{
    test_utils::{PeerBehaviour, PeerConfig, TEST_PROTOCOL_VERSION},
    EthResponse, NetworkEvent, Status,
};
use fbc_primitives::{Bytes, B256, U256};
use fbc_sync::{SyncError, SyncEvent};
use futures::StreamExt;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test(start_paused = true)]
async fn state_root_mismatch_bans_the_supplier() {
    fbc_tracing::init_test_tracing();
    let chain = TestChain::new(20, 1);
    let invalid = Arc::new(chain.with_invalid_state_root(1));
    let mut node = TestNode::spawn(chain.store(0), config());
    let bad = node.connect(1, PeerConfig::new(invalid)).await;

    let (started, outcome) = node.sync().await;
    assert_matches!(started, Some(SyncEvent::Started { mode: SyncMode::Full, .. }));
    let SyncEvent::Failed { error } = outcome else { panic!("expected failure, got {outcome:?}") };
    assert_matches!(
        error,
        SyncError::StateRootMismatch { number: 1, peer_id: Some(peer_id), .. } if peer_id == bad
    );
    assert!(error.is_fatal());

    // nothing of the invalid chain was committed
    assert_eq!(node.head(), chain.store(0).head().unwrap());
    assert!(node.net.disconnected().contains(&bad));
    assert!(!node.net.is_connected(&bad));
}

#[tokio::test(start_paused = true)]
async fn corrupt_bodies_ban_the_peer_and_sync_completes() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(40, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    let honest = node.connect(1, PeerConfig::new(chain.clone())).await;
    let corrupt = node
        .connect(2, PeerConfig::new(chain.clone()).with_behaviour(PeerBehaviour::CorruptBodies))
        .await;

    let (_, outcome) = node.sync().await;
    assert_eq!(outcome, SyncEvent::Done { head: 40, hash: chain.tip().hash() });
    assert_eq!(node.head(), chain.head());
    assert!(node.net.disconnected().contains(&corrupt));
    assert!(!node.net.disconnected().contains(&honest));
}

#[tokio::test(start_paused = true)]
async fn unresponsive_peer_is_dropped() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(40, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    node.connect(1, PeerConfig::new(chain.clone())).await;
    let silent = node
        .connect(2, PeerConfig::new(chain.clone()).with_behaviour(PeerBehaviour::Unresponsive))
        .await;

    let (_, outcome) = node.sync().await;
    assert_eq!(outcome, SyncEvent::Done { head: 40, hash: chain.tip().hash() });
    assert!(node.net.requests_to(&silent) > 0);
    assert!(node.net.disconnected().contains(&silent));
}

#[tokio::test(start_paused = true)]
async fn session_fails_once_every_peer_is_gone() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(40, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    node.connect(1, PeerConfig::new(chain.clone()).with_behaviour(PeerBehaviour::WrongKind))
        .await;

    let (started, outcome) = node.sync().await;
    assert_eq!(started, None);
    assert_eq!(outcome, SyncEvent::Failed { error: SyncError::NoPeers });
    assert!(node.net.disconnected().contains(&peer(1)));
}

#[tokio::test(start_paused = true)]
async fn tampered_pivot_state_is_fatal_and_disables_fast_sync() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(150, 1));
    let store = chain.store(0);
    let genesis: HashSet<B256> = chain.state_nodes(0).into_iter().map(|(hash, _)| hash).collect();
    let (tampered, _) = chain
        .state_nodes(86)
        .into_iter()
        .find(|(hash, _)| !genesis.contains(hash))
        .unwrap();
    store.kv().put(tampered, Bytes::from_static(b"tampered")).unwrap();

    let mut node = TestNode::spawn(store, config());
    node.connect(1, PeerConfig::new(chain.clone())).await;
    node.connect(2, PeerConfig::new(chain.clone())).await;

    let (started, outcome) = node.sync().await;
    assert_matches!(started, Some(SyncEvent::Started { mode: SyncMode::Fast, pivot: Some(86), .. }));
    let SyncEvent::Failed { error } = outcome else { panic!("expected failure, got {outcome:?}") };
    assert_matches!(
        error,
        SyncError::PivotStateMismatch { number: 86, expected, .. } if expected == tampered
    );
    assert!(error.is_fatal());
    assert_eq!(node.head().number, 0);

    // the next session executes every block instead
    let (started, outcome) = node.sync().await;
    assert_matches!(started, Some(SyncEvent::Started { mode: SyncMode::Full, pivot: None, .. }));
    assert_eq!(outcome, SyncEvent::Done { head: 150, hash: chain.tip().hash() });
    assert_eq!(node.executor.executed(), 150);
}

#[tokio::test(start_paused = true)]
async fn stale_response_is_ignored() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(20, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    let peer_id = node.connect(1, PeerConfig::new(chain.clone())).await;
    let (_, outcome) = node.sync().await;
    assert_eq!(outcome, SyncEvent::Done { head: 20, hash: chain.tip().hash() });

    let header = chain.block(3).unwrap().header.header().clone();
    node.net.emit(NetworkEvent::Response {
        peer_id,
        request_id: 9_999,
        response: EthResponse::BlockHeaders(vec![header]),
    });
    settle().await;

    assert_eq!(node.head(), chain.head());
    assert!(node.net.is_connected(&peer_id));
    assert!(node.net.disconnected().is_empty());
    assert_matches!(node.events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn foreign_genesis_is_rejected_at_handshake() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(20, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    let stranger = peer(7);
    node.net.emit(NetworkEvent::SessionEstablished {
        peer_id: stranger,
        status: Status {
            version: TEST_PROTOCOL_VERSION,
            total_difficulty: U256::from(1_000),
            head: B256::repeat_byte(1),
            genesis: B256::repeat_byte(2),
        },
    });
    settle().await;
    assert_eq!(node.net.disconnected(), vec![stranger]);

    node.handle.start();
    settle().await;
    assert_matches!(node.events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn execution_failure_is_fatal() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(20, 1));
    let node = TestNode::spawn(chain.store(0), config());
    let mut events = node.handle.event_stream();
    node.executor.set_fail_execution(true);
    node.connect(1, PeerConfig::new(chain.clone())).await;

    node.handle.start();
    let error = loop {
        match events.next().await {
            Some(Ok(SyncEvent::Failed { error })) => break error,
            Some(Ok(_)) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_matches!(error, SyncError::Execution { number: 1, .. });
    assert!(error.is_fatal());
    assert_eq!(node.head().number, 0);
    assert!(node.net.is_connected(&peer(1)));
}

#[tokio::test(start_paused = true)]
async fn forged_skeleton_bans_its_source() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(100, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    let forger = node
        .connect(
            1,
            PeerConfig::new(chain.clone())
                .with_behaviour(PeerBehaviour::ForgedSkeleton)
                .with_delay(Duration::from_millis(100)),
        )
        .await;

    // the forger is the only candidate for master, the others join while it is being asked
    node.handle.start();
    let honest = [
        node.connect(2, PeerConfig::new(chain.clone())).await,
        node.connect(3, PeerConfig::new(chain.clone())).await,
    ];

    let (started, outcome) = node.outcome().await;
    assert_matches!(started, Some(SyncEvent::Started { target: 100, .. }));
    assert_eq!(outcome, SyncEvent::Done { head: 100, hash: chain.tip().hash() });
    assert_eq!(node.head(), chain.head());
    assert!(node.net.disconnected().contains(&forger));
    for peer_id in honest {
        assert!(node.net.is_connected(&peer_id));
    }
}

#[tokio::test(start_paused = true)]
async fn invalid_seal_bans_the_supplier_and_continues() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(40, 1));
    let mut node = TestNode::spawn(chain.store(0), config());
    node.consensus.set_invalid_seal(chain.block(25).unwrap().hash());
    let first = node.connect(1, PeerConfig::new(chain.clone())).await;
    let second = node.connect(2, PeerConfig::new(chain.clone())).await;

    let (started, outcome) = node.sync().await;
    assert_matches!(started, Some(SyncEvent::Started { mode: SyncMode::Full, .. }));
    // the headers were fetched again after the first supplier was banned, until none was left
    assert_eq!(outcome, SyncEvent::Failed { error: SyncError::NoPeers });
    assert!(node.net.disconnected().contains(&first));
    assert!(node.net.disconnected().contains(&second));

    let head = node.head();
    assert!(head.number < 25);
    assert_eq!(head.hash, chain.block(head.number).unwrap().hash());
}
