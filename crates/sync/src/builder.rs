//! Wiring of the sync engine on top of a transport.

use crate::{ChainImporter, ProtocolHandler, SyncHandle, Synchronizer};
use fbc_config::Config;
use fbc_interfaces::{
    consensus::Consensus,
    executor::BlockExecutor,
    provider::{ChainStore, ProviderError, ProviderResult},
};
use fbc_network::{
    BlockFetcher, Correlator, FetchClient, FetcherTask, NetworkEvent, PeerTransport,
};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Builds the tasks of the sync engine.
pub struct SyncBuilder {
    config: Config,
    transport: Arc<dyn PeerTransport>,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    store: Arc<dyn ChainStore>,
    consensus: Arc<dyn Consensus>,
    executor: Arc<dyn BlockExecutor>,
    shutdown: CancellationToken,
}

impl SyncBuilder {
    /// Creates a builder for the transport and the events it emits.
    pub fn new(
        config: Config,
        transport: Arc<dyn PeerTransport>,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
        store: Arc<dyn ChainStore>,
        consensus: Arc<dyn Consensus>,
        executor: Arc<dyn BlockExecutor>,
    ) -> Self {
        Self {
            config,
            transport,
            events,
            store,
            consensus,
            executor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stops every task once the token is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Creates the synchronizer, the propagation fetcher and the protocol handler.
    ///
    /// Fails if the store has no genesis block.
    pub fn build(self) -> ProviderResult<SyncTasks> {
        let Self { config, transport, events, store, consensus, executor, shutdown } = self;
        let genesis = store
            .canonical_hash(0)?
            .ok_or_else(|| ProviderError::Database("missing genesis block".to_string()))?;

        let correlator = Correlator::new(transport);
        let client = FetchClient::new(correlator.clone());
        let (synchronizer, handle) = Synchronizer::new(
            &config,
            client.clone(),
            store.clone(),
            consensus.clone(),
            executor.clone(),
            shutdown.clone(),
        );

        let importer = ChainImporter::new(store, consensus, executor);
        let fetcher =
            BlockFetcher::new(config.fetcher.clone(), importer, Arc::new(handle.status().clone()));
        let (fetcher_events_tx, fetcher_events) = mpsc::unbounded_channel();
        let (fetcher, fetcher_handle) =
            FetcherTask::new(fetcher, client, fetcher_events_tx, shutdown.clone());

        let handler = ProtocolHandler::new(
            genesis,
            correlator,
            handle.clone(),
            fetcher_handle,
            events,
            fetcher_events,
            shutdown,
        );
        Ok(SyncTasks { synchronizer, fetcher, handler, handle })
    }
}

impl fmt::Debug for SyncBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncBuilder")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// The tasks of the sync engine, ready to be spawned.
#[derive(Debug)]
#[must_use = "the tasks do nothing unless spawned"]
pub struct SyncTasks {
    synchronizer: Synchronizer,
    fetcher: FetcherTask<ChainImporter>,
    handler: ProtocolHandler,
    handle: SyncHandle,
}

impl SyncTasks {
    /// The handle to the synchronizer.
    pub const fn handle(&self) -> &SyncHandle {
        &self.handle
    }

    /// Spawns every task on the current runtime.
    pub fn spawn(self) -> SyncHandle {
        tokio::spawn(self.synchronizer.run());
        tokio::spawn(self.fetcher.run());
        tokio::spawn(self.handler.run());
        self.handle
    }
}
