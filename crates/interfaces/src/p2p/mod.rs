/// Error types for requests and downloads.
pub mod error;

use std::fmt;

/// Identifier of a request sent to a peer. Every dispatched batch of work items travels in exactly
/// one request, so this also identifies the work assigned to a peer.
pub type RequestId = u64;

/// The stages of data the sync engine downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKind {
    /// Block headers, fetched as contiguous ranges.
    Headers,
    /// Block bodies, fetched by block hash.
    Bodies,
    /// Block receipts, fetched by block hash.
    Receipts,
    /// State trie nodes, fetched by node hash.
    State,
}

impl WorkKind {
    /// All kinds, in pipeline order.
    pub const ALL: [Self; 4] = [Self::Headers, Self::Bodies, Self::Receipts, Self::State];

    /// Returns the kind as a string, used as a metric and tracing label.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Headers => "headers",
            Self::Bodies => "bodies",
            Self::Receipts => "receipts",
            Self::State => "states",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
