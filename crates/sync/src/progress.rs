use crate::error::SyncError;
use fbc_config::SyncMode;
use fbc_interfaces::sync::{SyncState, SyncStateProvider, SyncStateUpdater};
use fbc_primitives::{BlockHash, BlockNumber};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// The phase a sync session is in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// No session has run yet.
    #[default]
    Idle,
    /// Negotiating with peers, finding the common ancestor or downloading headers.
    HeaderSync,
    /// Headers are complete, bodies and receipts are still being downloaded.
    BlockSync,
    /// Downloading the state trie of the pivot block.
    StatePivot,
    /// Everything is downloaded, the remaining blocks are being committed.
    Committing,
    /// The last session reached its target.
    Done,
    /// The last session was cancelled.
    Cancelled,
    /// The last session failed.
    Failed,
}

impl SessionState {
    /// Returns `true` if a session is running.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::HeaderSync | Self::BlockSync | Self::StatePivot | Self::Committing)
    }
}

/// Snapshot of the progress of the current or last sync session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Local head when the session started
    pub starting_block: BlockNumber,
    /// Highest block committed so far
    pub current_block: BlockNumber,
    /// The session target
    pub highest_block: BlockNumber,
    /// State nodes downloaded
    pub pulled_states: u64,
    /// State nodes known to be needed, downloaded or not
    pub known_states: u64,
    /// Current phase
    pub state: SessionState,
}

/// Events emitted by the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A session started.
    Started {
        /// Chosen sync mode
        mode: SyncMode,
        /// Number of the target block
        target: BlockNumber,
        /// Hash of the target block
        target_hash: BlockHash,
        /// The common ancestor with the remote chain
        ancestor: BlockNumber,
        /// The pivot block, in fast mode
        pivot: Option<BlockNumber>,
    },
    /// A session reached its target.
    Done {
        /// The new local head
        head: BlockNumber,
        /// Hash of the new local head
        hash: BlockHash,
    },
    /// A session failed or was cancelled.
    Failed {
        /// Why
        error: SyncError,
    },
}

/// Shared flag telling whether a bulk sync session is running.
///
/// The synchronizer flips it, the propagation fetcher reads it to stay inert during a session.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    syncing: Arc<AtomicBool>,
}

impl SyncStateProvider for SyncStatus {
    fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Relaxed)
    }
}

impl SyncStateUpdater for SyncStatus {
    fn update_sync_state(&self, state: SyncState) {
        self.syncing.store(state.is_syncing(), Ordering::Relaxed)
    }
}
