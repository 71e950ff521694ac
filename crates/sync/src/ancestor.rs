//! Search for the highest block shared by the local chain and the master peer's chain.
//!
//! The search first asks for the most recent `max_header_fetch` headers below the lower of both
//! heads, which finds the ancestor of any short reorg in a single round trip. If none of them is
//! canonical locally, it checks the lowest block it is willing to reorg to, and then bisects the
//! range in between one header at a time.

use crate::error::SyncError;
use fbc_config::SyncConfig;
use fbc_interfaces::{p2p::error::DownloadError, provider::ChainStore};
use fbc_network::GetBlockHeaders;
use fbc_primitives::{BlockHash, BlockNumber, Header, PeerId, SealedHeader};
use tracing::trace;

/// What the search needs next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AncestorStep {
    /// Ask the master peer for these headers and feed the answer back.
    Request(GetBlockHeaders),
    /// The common ancestor.
    Found {
        /// Its number
        number: BlockNumber,
        /// Its hash
        hash: BlockHash,
    },
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Waiting for the headers `floor..=ceil`.
    Span { floor: BlockNumber, ceil: BlockNumber },
    /// Waiting for the deepest header a reorg may reach; `high` is known not to match.
    Bottom { bottom: BlockNumber, high: BlockNumber },
    /// `low` matches and `high` does not; waiting for `probe`.
    Bisect { low: BlockNumber, low_hash: BlockHash, high: BlockNumber, probe: BlockNumber },
    Done,
}

/// Common ancestor search, driven by the header responses of the master peer.
#[derive(Debug)]
pub(crate) struct AncestorSearch {
    peer_id: PeerId,
    local_head: BlockNumber,
    max_depth: u64,
    phase: Phase,
}

impl AncestorSearch {
    pub(crate) fn new(
        peer_id: PeerId,
        local_head: BlockNumber,
        remote_head: BlockNumber,
        config: &SyncConfig,
    ) -> Self {
        let ceil = local_head.min(remote_head);
        let floor = ceil.saturating_sub(config.max_header_fetch.saturating_sub(1));
        Self {
            peer_id,
            local_head,
            max_depth: config.max_fork_ancestry,
            phase: Phase::Span { floor, ceil },
        }
    }

    /// The request the search is waiting for.
    pub(crate) fn request(&self) -> Option<GetBlockHeaders> {
        match self.phase {
            Phase::Span { floor, ceil } => Some(GetBlockHeaders::rising(floor, ceil - floor + 1)),
            Phase::Bottom { bottom, .. } => Some(GetBlockHeaders::rising(bottom, 1)),
            Phase::Bisect { probe, .. } => Some(GetBlockHeaders::rising(probe, 1)),
            Phase::Done => None,
        }
    }

    /// Feeds the master's answer to [`AncestorSearch::request`].
    pub(crate) fn on_headers(
        &mut self,
        headers: Vec<Header>,
        store: &dyn ChainStore,
    ) -> Result<AncestorStep, SyncError> {
        match self.phase {
            Phase::Span { floor, ceil } => {
                let headers = self.check(headers, floor, ceil - floor + 1)?;
                for header in headers.iter().rev() {
                    if is_canonical(header, store)? {
                        return Ok(self.found(header.number, header.hash()))
                    }
                }
                if floor == 0 {
                    return Err(self.genesis_mismatch(&headers[0], store)?)
                }

                let bottom = self.local_head.saturating_sub(self.max_depth);
                if bottom >= floor {
                    return Err(self.not_found())
                }
                trace!(target: "sync::controller", floor, bottom, "Ancestor not in span, bisecting");
                self.phase = Phase::Bottom { bottom, high: floor };
                self.next()
            }
            Phase::Bottom { bottom, high } => {
                let header = self.check(headers, bottom, 1)?.remove(0);
                if !is_canonical(&header, store)? {
                    return Err(if bottom == 0 {
                        self.genesis_mismatch(&header, store)?
                    } else {
                        self.not_found()
                    })
                }
                self.bisect(bottom, header.hash(), high)
            }
            Phase::Bisect { low, low_hash, high, probe } => {
                let header = self.check(headers, probe, 1)?.remove(0);
                if is_canonical(&header, store)? {
                    self.bisect(probe, header.hash(), high)
                } else {
                    self.bisect(low, low_hash, probe)
                }
            }
            Phase::Done => {
                Err(SyncError::MasterPeer { peer_id: self.peer_id, error: DownloadError::StaleDelivery })
            }
        }
    }

    fn bisect(
        &mut self,
        low: BlockNumber,
        low_hash: BlockHash,
        high: BlockNumber,
    ) -> Result<AncestorStep, SyncError> {
        if low + 1 >= high {
            return Ok(self.found(low, low_hash))
        }
        let probe = low + (high - low) / 2;
        self.phase = Phase::Bisect { low, low_hash, high, probe };
        self.next()
    }

    fn next(&self) -> Result<AncestorStep, SyncError> {
        self.request().map(AncestorStep::Request).ok_or(SyncError::MasterPeer {
            peer_id: self.peer_id,
            error: DownloadError::StaleDelivery,
        })
    }

    fn found(&mut self, number: BlockNumber, hash: BlockHash) -> AncestorStep {
        trace!(target: "sync::controller", number, %hash, "Found common ancestor");
        self.phase = Phase::Done;
        AncestorStep::Found { number, hash }
    }

    fn not_found(&self) -> SyncError {
        SyncError::AncestorNotFound { head: self.local_head, max_depth: self.max_depth }
    }

    fn genesis_mismatch(
        &self,
        remote: &SealedHeader,
        store: &dyn ChainStore,
    ) -> Result<SyncError, SyncError> {
        let local = store.canonical_hash(0)?.unwrap_or_default();
        Ok(SyncError::GenesisMismatch { local, remote: remote.hash() })
    }

    /// Seals the headers, checking that they are the `count` headers starting at `start`. A
    /// shorter answer is accepted as long as it is not empty.
    fn check(
        &self,
        headers: Vec<Header>,
        start: BlockNumber,
        count: u64,
    ) -> Result<Vec<SealedHeader>, SyncError> {
        let fault = |error| SyncError::MasterPeer { peer_id: self.peer_id, error };
        if headers.is_empty() {
            return Err(fault(DownloadError::EmptyResponse))
        }
        if headers.len() as u64 > count {
            return Err(fault(DownloadError::TooManyHeaders {
                received: headers.len() as u64,
                expected: count,
            }))
        }
        headers
            .into_iter()
            .zip(start..)
            .map(|(header, expected)| {
                if header.number != expected {
                    return Err(fault(DownloadError::HeadersResponseStartBlockMismatch {
                        received: header.number,
                        expected,
                    }))
                }
                Ok(header.seal_slow())
            })
            .collect()
    }
}

fn is_canonical(header: &SealedHeader, store: &dyn ChainStore) -> Result<bool, SyncError> {
    Ok(store.canonical_hash(header.number)? == Some(header.hash()))
}
