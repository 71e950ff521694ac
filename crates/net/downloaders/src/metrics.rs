use fbc_interfaces::p2p::WorkKind;
use metrics::{Counter, Gauge, Histogram};
use std::{fmt, time::Duration};

/// Per-kind download metrics, registered under `downloader.<kind>.*`.
pub struct DownloadKindMetrics {
    /// Items delivered and accepted
    pub items_in: Counter,
    /// Items dropped because the delivery was invalid or stale
    pub items_drop: Counter,
    /// Items whose request expired
    pub items_timeout: Counter,
    /// Duration of answered requests, in seconds
    pub request_duration: Histogram,
}

impl DownloadKindMetrics {
    fn new(kind: WorkKind) -> Self {
        let scope = kind.as_str();
        Self {
            items_in: metrics::counter!(format!("downloader.{scope}.in")),
            items_drop: metrics::counter!(format!("downloader.{scope}.drop")),
            items_timeout: metrics::counter!(format!("downloader.{scope}.timeout")),
            request_duration: metrics::histogram!(format!("downloader.{scope}.req")),
        }
    }
}

/// Metrics of the [`TaskQueue`](crate::TaskQueue) and the requests it feeds.
pub struct DownloaderMetrics {
    /// Header metrics
    pub headers: DownloadKindMetrics,
    /// Body metrics
    pub bodies: DownloadKindMetrics,
    /// Receipt metrics
    pub receipts: DownloadKindMetrics,
    /// State node metrics
    pub states: DownloadKindMetrics,
    /// Blocks downloaded but not yet handed out for commit
    pub buffered_blocks: Gauge,
}

impl DownloaderMetrics {
    /// Returns the metrics of the given kind.
    pub fn kind(&self, kind: WorkKind) -> &DownloadKindMetrics {
        match kind {
            WorkKind::Headers => &self.headers,
            WorkKind::Bodies => &self.bodies,
            WorkKind::Receipts => &self.receipts,
            WorkKind::State => &self.states,
        }
    }

    /// Records the duration of an answered request.
    pub fn record_request(&self, kind: WorkKind, elapsed: Duration) {
        self.kind(kind).request_duration.record(elapsed.as_secs_f64())
    }
}

impl Default for DownloaderMetrics {
    fn default() -> Self {
        Self {
            headers: DownloadKindMetrics::new(WorkKind::Headers),
            bodies: DownloadKindMetrics::new(WorkKind::Bodies),
            receipts: DownloadKindMetrics::new(WorkKind::Receipts),
            states: DownloadKindMetrics::new(WorkKind::State),
            buffered_blocks: metrics::gauge!("downloader.blocks.buffered"),
        }
    }
}

impl fmt::Debug for DownloadKindMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadKindMetrics").finish_non_exhaustive()
    }
}

impl fmt::Debug for DownloaderMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloaderMetrics").finish_non_exhaustive()
    }
}
