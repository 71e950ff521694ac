//! Block propagation through the fetcher task

use fbc_config::FetcherConfig;
use fbc_interfaces::{
    consensus::Consensus,
    executor::BlockExecutor,
    provider::ChainStore,
    sync::NoopSyncStateUpdater,
    test_utils::{TestChain, TestChainStore, TestConsensus, TestExecutor},
    FbcError, FbcResult,
};
use fbc_network::{
    test_utils::{PeerConfig, Testnet},
    BlockFetcher, BlockImporter, Correlator, FetchClient, FetcherEvent, FetcherTask, NetworkEvent,
};
use fbc_primitives::{BlockHash, Head, SealedBlock, B512};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct StoreImporter {
    store: Arc<TestChainStore>,
    consensus: TestConsensus,
    executor: TestExecutor,
}

impl BlockImporter for StoreImporter {
    fn head(&self) -> FbcResult<Head> {
        Ok(self.store.head()?)
    }

    fn has_block(&self, hash: &BlockHash) -> FbcResult<bool> {
        Ok(self.store.has_block(hash)?)
    }

    fn import_block(&self, block: SealedBlock) -> FbcResult<()> {
        let parent = self
            .store
            .header(&block.parent_hash)?
            .ok_or_else(|| FbcError::Custom("unknown parent".to_string()))?;
        self.consensus.validate_header(&block.header, &parent)?;
        let outcome = self.executor.execute(&block, parent.state_root, self.store.as_ref())?;
        self.store.kv().extend(outcome.trie_nodes);
        self.store.write_block(block, outcome.receipts)?;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_announced_blocks_are_imported() {
    fbc_tracing::init_test_tracing();
    let chain = Arc::new(TestChain::new(14, 5));
    let store = Arc::new(chain.store(10));
    let (net, mut net_events) = Testnet::new();
    let peer = B512::with_last_byte(9);
    net.add_peer(peer, PeerConfig::new(chain.clone()).with_delay(Duration::from_millis(30)));

    let correlator = Correlator::new(net.clone());
    let importer = StoreImporter {
        store: store.clone(),
        consensus: TestConsensus::default(),
        executor: TestExecutor::default(),
    };
    let fetcher =
        BlockFetcher::new(FetcherConfig::default(), importer, Arc::new(NoopSyncStateUpdater::default()));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let (task, handle) =
        FetcherTask::new(fetcher, FetchClient::new(correlator.clone()), events_tx, cancel.clone());
    tokio::spawn(task.run());

    // route network events like the protocol handler does
    tokio::spawn(async move {
        while let Some(event) = net_events.recv().await {
            match event {
                NetworkEvent::Response { peer_id, request_id, response } => {
                    correlator.complete(peer_id, request_id, response);
                }
                NetworkEvent::NewBlockHashes { peer_id, hashes } => handle.announce(peer_id, hashes),
                NetworkEvent::NewBlock { peer_id, block } => handle.inject(peer_id, block.block),
                _ => {}
            }
        }
    });

    // 11 and 12 are announced, 14 is pushed in full and needs its parent 13 looked up
    net.announce(peer, chain.block(11).unwrap());
    net.announce(peer, chain.block(12).unwrap());
    net.propagate(peer, chain.block(14).unwrap().clone(), chain.head().total_difficulty);

    let mut imported = Vec::new();
    while imported.len() < 4 {
        match events.recv().await.unwrap() {
            FetcherEvent::Imported { number, .. } => imported.push(number),
            FetcherEvent::BadPeer { peer_id } => panic!("unexpected bad peer {peer_id}"),
        }
    }
    imported.sort_unstable();
    assert_eq!(imported, vec![11, 12, 13, 14]);
    assert_eq!(store.head().unwrap(), chain.head());
    cancel.cancel();
}
