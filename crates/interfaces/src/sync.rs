//! Traits used when interacting with the sync status of the node.

/// A type that provides information about whether the node is currently syncing.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait SyncStateProvider: Send + Sync {
    /// Returns `true` if a bulk sync session is active.
    fn is_syncing(&self) -> bool;
}

/// An updater for the [`SyncState`] of the node.
///
/// The propagation fetcher consults the provider side and stays inert while the bulk
/// synchronizer is busy; the synchronizer flips the state at session start and end.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait SyncStateUpdater: SyncStateProvider {
    /// Notifies about a [`SyncState`] update.
    fn update_sync_state(&self, state: SyncState);
}

/// The state the node is currently in when it comes to synchronization.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub enum SyncState {
    /// Node sync is complete, new blocks arrive through propagation.
    #[default]
    Idle,
    /// A bulk sync session is running.
    Syncing,
}

impl SyncState {
    /// Whether the node is currently syncing.
    pub const fn is_syncing(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// A [`SyncStateUpdater`] implementation that does nothing.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct NoopSyncStateUpdater;

impl SyncStateProvider for NoopSyncStateUpdater {
    fn is_syncing(&self) -> bool {
        false
    }
}

impl SyncStateUpdater for NoopSyncStateUpdater {
    fn update_sync_state(&self, _state: SyncState) {}
}
