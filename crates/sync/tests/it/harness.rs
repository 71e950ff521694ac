//! A node with a running sync engine on top of a simulated network

use fbc_config::{Config, SyncConfig};
use fbc_interfaces::{
    provider::ChainStore,
    test_utils::{TestChainStore, TestConsensus, TestExecutor},
};
use fbc_network::test_utils::{PeerConfig, Testnet};
use fbc_primitives::{Head, PeerId};
use fbc_sync::{SyncBuilder, SyncEvent, SyncHandle};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Small fetch limits, so that short chains still take several rounds.
pub fn config() -> Config {
    Config {
        sync: SyncConfig {
            fast_sync_threshold: 64,
            pivot_margin: 64,
            max_header_fetch: 32,
            max_skeleton_size: 8,
            max_body_fetch: 16,
            max_receipt_fetch: 16,
            max_state_fetch: 16,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn peer(id: u8) -> PeerId {
    PeerId::with_last_byte(id)
}

/// Lets every task run until the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Polls the condition until it holds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return
        }
        settle().await;
    }
    panic!("condition not met in time");
}

pub struct TestNode {
    pub net: Arc<Testnet>,
    pub store: Arc<TestChainStore>,
    pub executor: Arc<TestExecutor>,
    pub consensus: Arc<TestConsensus>,
    pub handle: SyncHandle,
    pub events: broadcast::Receiver<SyncEvent>,
    shutdown: CancellationToken,
}

impl TestNode {
    pub fn spawn(store: TestChainStore, config: Config) -> Self {
        let (net, net_events) = Testnet::new();
        let store = Arc::new(store);
        let executor = Arc::new(TestExecutor::default());
        let consensus = Arc::new(TestConsensus::default());
        let shutdown = CancellationToken::new();
        let tasks = SyncBuilder::new(
            config,
            net.clone(),
            net_events,
            store.clone(),
            consensus.clone(),
            executor.clone(),
        )
        .with_shutdown(shutdown.clone())
        .build()
        .expect("store has a genesis block");
        let events = tasks.handle().subscribe();
        let handle = tasks.spawn();
        Self { net, store, executor, consensus, handle, events, shutdown }
    }

    /// Connects a simulated peer and waits until the synchronizer knows it.
    pub async fn connect(&self, id: u8, config: PeerConfig) -> PeerId {
        let peer_id = peer(id);
        self.net.add_peer(peer_id, config);
        settle().await;
        peer_id
    }

    /// Starts a session and waits for its outcome.
    pub async fn sync(&mut self) -> (Option<SyncEvent>, SyncEvent) {
        self.handle.start();
        self.outcome().await
    }

    /// Waits for the next event.
    pub async fn next_event(&mut self) -> SyncEvent {
        tokio::time::timeout(SESSION_TIMEOUT, self.events.recv())
            .await
            .expect("no event in time")
            .expect("event channel closed")
    }

    /// Waits for the outcome of a session, returning the `Started` event seen before it.
    pub async fn outcome(&mut self) -> (Option<SyncEvent>, SyncEvent) {
        let mut started = None;
        loop {
            let event = self.next_event().await;
            match event {
                SyncEvent::Started { .. } => started = Some(event),
                outcome => return (started, outcome),
            }
        }
    }

    pub fn head(&self) -> Head {
        self.store.head().unwrap()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
