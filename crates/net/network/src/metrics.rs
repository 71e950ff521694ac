use metrics::{Counter, Gauge};
use std::fmt;

/// Metrics of the [`PeerRegistry`](crate::PeerRegistry).
pub(crate) struct PeerRegistryMetrics {
    /// Number of registered peers
    pub(crate) registered_peers: Gauge,
    /// Number of peers that were banned
    pub(crate) banned_peers: Counter,
    /// Number of requests that timed out
    pub(crate) request_timeouts: Counter,
}

impl Default for PeerRegistryMetrics {
    fn default() -> Self {
        Self {
            registered_peers: metrics::gauge!("network.registered_peers"),
            banned_peers: metrics::counter!("network.banned_peers"),
            request_timeouts: metrics::counter!("network.request_timeouts"),
        }
    }
}

/// Metrics of the [`BlockFetcher`](crate::BlockFetcher).
pub(crate) struct BlockFetcherMetrics {
    /// Incoming announcements
    pub(crate) announces_in: Counter,
    /// Announced blocks that were imported
    pub(crate) announces_out: Counter,
    /// Announcements dropped as stale, known or while syncing
    pub(crate) announces_drop: Counter,
    /// Announcements dropped because the peer exceeded its allowance
    pub(crate) announces_dos: Counter,
    /// Incoming propagated blocks
    pub(crate) broadcasts_in: Counter,
    /// Propagated blocks that were imported
    pub(crate) broadcasts_out: Counter,
    /// Propagated blocks dropped as stale, known or while syncing
    pub(crate) broadcasts_drop: Counter,
    /// Propagated blocks dropped because the peer exceeded its allowance
    pub(crate) broadcasts_dos: Counter,
    /// Header fetches sent for announced blocks
    pub(crate) fetch_headers: Counter,
    /// Body fetches sent for announced blocks
    pub(crate) fetch_bodies: Counter,
    /// Headers received in answer to fetches
    pub(crate) filter_headers_in: Counter,
    /// Fetched headers that matched the requested block
    pub(crate) filter_headers_out: Counter,
    /// Bodies received in answer to fetches
    pub(crate) filter_bodies_in: Counter,
    /// Fetched bodies that matched their header
    pub(crate) filter_bodies_out: Counter,
    /// Fetches that failed or timed out
    pub(crate) fetch_timeouts: Counter,
    /// Imports rejected by consensus or execution
    pub(crate) import_failures: Counter,
    /// Number of blocks waiting for import
    pub(crate) queued_blocks: Gauge,
}

impl Default for BlockFetcherMetrics {
    fn default() -> Self {
        Self {
            announces_in: metrics::counter!("fetcher.prop.announces.in"),
            announces_out: metrics::counter!("fetcher.prop.announces.out"),
            announces_drop: metrics::counter!("fetcher.prop.announces.drop"),
            announces_dos: metrics::counter!("fetcher.prop.announces.dos"),
            broadcasts_in: metrics::counter!("fetcher.prop.broadcasts.in"),
            broadcasts_out: metrics::counter!("fetcher.prop.broadcasts.out"),
            broadcasts_drop: metrics::counter!("fetcher.prop.broadcasts.drop"),
            broadcasts_dos: metrics::counter!("fetcher.prop.broadcasts.dos"),
            fetch_headers: metrics::counter!("fetcher.fetch.headers"),
            fetch_bodies: metrics::counter!("fetcher.fetch.bodies"),
            filter_headers_in: metrics::counter!("fetcher.filter.headers.in"),
            filter_headers_out: metrics::counter!("fetcher.filter.headers.out"),
            filter_bodies_in: metrics::counter!("fetcher.filter.bodies.in"),
            filter_bodies_out: metrics::counter!("fetcher.filter.bodies.out"),
            fetch_timeouts: metrics::counter!("fetcher.fetch.timeouts"),
            import_failures: metrics::counter!("fetcher.import.failures"),
            queued_blocks: metrics::gauge!("fetcher.queue.blocks"),
        }
    }
}

impl fmt::Debug for PeerRegistryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistryMetrics").finish_non_exhaustive()
    }
}

impl fmt::Debug for BlockFetcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFetcherMetrics").finish_non_exhaustive()
    }
}
