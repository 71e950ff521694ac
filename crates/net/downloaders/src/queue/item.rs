use fbc_interfaces::p2p::WorkKind;
use fbc_primitives::{BlockHash, BlockNumber, PeerId, B256};
use std::collections::HashSet;
use tokio::time::Instant;

/// Identifies a unit of downloadable work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKey {
    /// A contiguous range of `count` headers starting at `start`.
    Headers {
        /// First header of the range
        start: BlockNumber,
        /// Length of the range
        count: u64,
    },
    /// The body of the block with this hash.
    Body(BlockHash),
    /// The receipts of the block with this hash.
    Receipts(BlockHash),
    /// The state trie node with this hash.
    Node(B256),
}

impl WorkKey {
    /// The kind of work this key describes.
    pub const fn kind(&self) -> WorkKind {
        match self {
            Self::Headers { .. } => WorkKind::Headers,
            Self::Body(_) => WorkKind::Bodies,
            Self::Receipts(_) => WorkKind::Receipts,
            Self::Node(_) => WorkKind::State,
        }
    }

    /// The hash the work is addressed by, if any.
    pub const fn hash(&self) -> Option<B256> {
        match self {
            Self::Headers { .. } => None,
            Self::Body(hash) | Self::Receipts(hash) | Self::Node(hash) => Some(*hash),
        }
    }
}

/// Lifecycle of a [`WorkItem`].
///
/// `Pending -> InFlight -> Done`, with `InFlight -> Pending` on release, failure or expiry and
/// `InFlight -> Failed` once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    /// Waiting to be reserved.
    Pending,
    /// Assigned to a peer until the deadline.
    InFlight {
        /// The peer serving the item
        peer_id: PeerId,
        /// When the assignment expires
        deadline: Instant,
    },
    /// Delivered and verified.
    Done,
    /// Retry budget exhausted.
    Failed,
}

/// A unit of work tracked by the [`TaskQueue`](crate::TaskQueue).
#[derive(Debug, Clone)]
pub struct WorkItem {
    key: WorkKey,
    state: WorkState,
    retries: usize,
    /// Position within the kind's pending set
    pub(crate) order: u64,
    /// Peers that failed to serve the item
    pub(crate) lacking: HashSet<PeerId>,
}

impl WorkItem {
    pub(crate) fn new(key: WorkKey, order: u64) -> Self {
        Self { key, state: WorkState::Pending, retries: 0, order, lacking: HashSet::new() }
    }

    /// The key of the item.
    pub const fn key(&self) -> &WorkKey {
        &self.key
    }

    /// The current state of the item.
    pub const fn state(&self) -> &WorkState {
        &self.state
    }

    /// How many times the item failed or expired.
    pub const fn retries(&self) -> usize {
        self.retries
    }

    /// Returns true if the item is assigned to the peer.
    pub fn is_inflight_at(&self, peer: &PeerId) -> bool {
        matches!(&self.state, WorkState::InFlight { peer_id, .. } if peer_id == peer)
    }

    /// Returns true if the peer already failed to serve this item.
    pub fn is_lacking(&self, peer: &PeerId) -> bool {
        self.lacking.contains(peer)
    }

    pub(crate) fn set_state(&mut self, state: WorkState) {
        self.state = state;
    }

    /// Bumps the retry counter, returning true if the budget is exceeded.
    pub(crate) fn bump(&mut self, max_retries: usize) -> bool {
        self.retries += 1;
        self.retries > max_retries
    }

    pub(crate) fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }
}
