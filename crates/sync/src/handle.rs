use crate::progress::{SyncEvent, SyncProgress, SyncStatus};
use fbc_interfaces::sync::SyncStateProvider;
use fbc_network::Status;
use fbc_primitives::{BlockHash, PeerId, U256};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

/// Commands accepted by the [`Synchronizer`](crate::Synchronizer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Start a session now. A running session is cancelled and replaced by the new one.
    Start,
    /// Abort the running session.
    Cancel,
    /// A peer completed its handshake.
    PeerConnected {
        /// The peer.
        peer_id: PeerId,
        /// Its handshake.
        status: Status,
    },
    /// A peer disconnected.
    PeerDisconnected {
        /// The peer.
        peer_id: PeerId,
    },
    /// A peer revealed a better head, e.g. by propagating a block.
    ///
    /// Restarts a running session whose target is lighter than the head.
    PeerHead {
        /// The peer.
        peer_id: PeerId,
        /// Hash of its head.
        head: BlockHash,
        /// Total difficulty of its head.
        total_difficulty: U256,
    },
}

/// A cloneable handle to a running [`Synchronizer`](crate::Synchronizer).
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<SyncCommand>,
    progress: watch::Receiver<SyncProgress>,
    events: broadcast::Sender<SyncEvent>,
    status: SyncStatus,
}

impl SyncHandle {
    pub(crate) const fn new(
        commands: mpsc::UnboundedSender<SyncCommand>,
        progress: watch::Receiver<SyncProgress>,
        events: broadcast::Sender<SyncEvent>,
        status: SyncStatus,
    ) -> Self {
        Self { commands, progress, events, status }
    }

    fn send(&self, command: SyncCommand) {
        let _ = self.commands.send(command);
    }

    /// Requests a sync session with the best peer, replacing the running one if any.
    pub fn start(&self) {
        self.send(SyncCommand::Start)
    }

    /// Aborts the running session, if any.
    pub fn cancel(&self) {
        self.send(SyncCommand::Cancel)
    }

    /// Registers a peer that completed its handshake.
    pub fn peer_connected(&self, peer_id: PeerId, status: Status) {
        self.send(SyncCommand::PeerConnected { peer_id, status })
    }

    /// Unregisters a peer.
    pub fn peer_disconnected(&self, peer_id: PeerId) {
        self.send(SyncCommand::PeerDisconnected { peer_id })
    }

    /// Records a better head advertised by the peer.
    pub fn peer_head(&self, peer_id: PeerId, head: BlockHash, total_difficulty: U256) {
        self.send(SyncCommand::PeerHead { peer_id, head, total_difficulty })
    }

    /// The latest progress snapshot.
    pub fn progress(&self) -> SyncProgress {
        *self.progress.borrow()
    }

    /// A stream of progress snapshots, starting with the current one.
    pub fn progress_stream(&self) -> WatchStream<SyncProgress> {
        WatchStream::new(self.progress.clone())
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// A stream of session events.
    pub fn event_stream(&self) -> BroadcastStream<SyncEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// The shared sync status.
    pub fn status(&self) -> &SyncStatus {
        &self.status
    }
}

impl SyncStateProvider for SyncHandle {
    fn is_syncing(&self) -> bool {
        self.status.is_syncing()
    }
}
