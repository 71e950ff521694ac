//! Routing of network events to the synchronizer, the correlator and the propagation fetcher.

use crate::SyncHandle;
use fbc_network::{Correlator, FetcherEvent, FetcherHandle, NetworkEvent, NewBlock};
use fbc_primitives::{PeerId, B256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Consumes the events of the transport and dispatches them.
///
/// Peers on a different genesis are disconnected at the handshake. Responses are handed to the
/// correlator, announcements and propagated blocks to the fetcher, and peer lifecycle and head
/// updates to the synchronizer.
#[derive(Debug)]
#[must_use = "the handler does nothing unless run"]
pub struct ProtocolHandler {
    genesis: B256,
    correlator: Correlator,
    sync: SyncHandle,
    fetcher: FetcherHandle,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    fetcher_events: mpsc::UnboundedReceiver<FetcherEvent>,
    shutdown: CancellationToken,
}

impl ProtocolHandler {
    /// Creates a new handler for a chain with the given genesis.
    pub const fn new(
        genesis: B256,
        correlator: Correlator,
        sync: SyncHandle,
        fetcher: FetcherHandle,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
        fetcher_events: mpsc::UnboundedReceiver<FetcherEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { genesis, correlator, sync, fetcher, events, fetcher_events, shutdown }
    }

    /// Runs until shutdown or until the transport closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.on_network_event(event),
                    None => break,
                },
                Some(event) = self.fetcher_events.recv() => self.on_fetcher_event(event),
            }
        }
        debug!(target: "net::handler", "Protocol handler stopped");
    }

    fn on_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::SessionEstablished { peer_id, status } => {
                if status.genesis != self.genesis {
                    debug!(target: "net::handler", ?peer_id, genesis = %status.genesis, "Peer on a different chain");
                    self.disconnect(peer_id);
                    return
                }
                self.sync.peer_connected(peer_id, status);
            }
            NetworkEvent::SessionClosed { peer_id } => {
                let cancelled = self.correlator.drop_peer(peer_id);
                trace!(target: "net::handler", ?peer_id, cancelled, "Session closed");
                self.sync.peer_disconnected(peer_id);
                self.fetcher.peer_dropped(peer_id);
            }
            NetworkEvent::NewBlockHashes { peer_id, hashes } => {
                self.fetcher.announce(peer_id, hashes);
            }
            NetworkEvent::NewBlock { peer_id, block: NewBlock { block, td } } => {
                // the peer has at least the parent of what it propagates
                let head = block.parent_hash;
                let parent_td = td.saturating_sub(block.difficulty);
                self.fetcher.inject(peer_id, block);
                self.sync.peer_head(peer_id, head, parent_td);
            }
            NetworkEvent::Response { peer_id, request_id, response } => {
                if self.correlator.complete(peer_id, request_id, response).is_none() {
                    trace!(target: "net::handler", ?peer_id, request_id, "Unsolicited response");
                }
            }
        }
    }

    fn on_fetcher_event(&self, event: FetcherEvent) {
        match event {
            FetcherEvent::Imported { peer_id, hash, number } => {
                trace!(target: "net::handler", ?peer_id, number, %hash, "Imported propagated block");
            }
            FetcherEvent::BadPeer { peer_id } => self.disconnect(peer_id),
        }
    }

    fn disconnect(&self, peer_id: PeerId) {
        self.correlator.transport().disconnect(peer_id);
    }
}
