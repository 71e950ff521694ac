use metrics::{Counter, Gauge};
use std::fmt;

/// Metrics of the [`Synchronizer`](crate::Synchronizer), registered under `sync.*`.
#[derive(Clone)]
pub(crate) struct SyncMetrics {
    /// Sessions started
    pub(crate) sessions_started: Counter,
    /// Sessions that reached their target
    pub(crate) sessions_done: Counter,
    /// Sessions that failed or were cancelled
    pub(crate) sessions_failed: Counter,
    /// Blocks written by sessions
    pub(crate) blocks_committed: Counter,
    /// Peers dropped for serving invalid data
    pub(crate) peers_banned: Counter,
    /// Target of the running session
    pub(crate) highest_block: Gauge,
    /// Highest block written by the running session
    pub(crate) current_block: Gauge,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            sessions_started: metrics::counter!("sync.sessions.started"),
            sessions_done: metrics::counter!("sync.sessions.done"),
            sessions_failed: metrics::counter!("sync.sessions.failed"),
            blocks_committed: metrics::counter!("sync.blocks.committed"),
            peers_banned: metrics::counter!("sync.peers.banned"),
            highest_block: metrics::gauge!("sync.block.highest"),
            current_block: metrics::gauge!("sync.block.current"),
        }
    }
}

impl fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncMetrics").finish_non_exhaustive()
    }
}
