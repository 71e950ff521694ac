use fbc_downloaders::QueueError;
use fbc_interfaces::{
    consensus::ConsensusError, executor::BlockExecutionError, p2p::error::DownloadError,
    provider::ProviderError,
};
use fbc_primitives::{BlockHash, BlockNumber, PeerId, B256};
use thiserror::Error;

/// A sync session error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No connected peer is ahead of the local chain, or every candidate was dropped.
    #[error("No peers available to sync with.")]
    NoPeers,
    /// Work is outstanding but no remaining peer can be assigned any of it.
    #[error("Remaining peers can not serve the outstanding work.")]
    PeersUnavailable,
    /// The session was cancelled.
    #[error("Sync session cancelled.")]
    Cancelled,
    /// The remote chain does not share our genesis block.
    #[error("Genesis mismatch: local {local}, remote {remote}.")]
    GenesisMismatch {
        /// The local genesis hash.
        local: BlockHash,
        /// The remote genesis hash.
        remote: BlockHash,
    },
    /// The remote chain forked off deeper than we are willing to look.
    #[error("No common ancestor within {max_depth} blocks of local head #{head}.")]
    AncestorNotFound {
        /// The local head.
        head: BlockNumber,
        /// How far below the head the search looked.
        max_depth: u64,
    },
    /// The peer chosen to lead the session misbehaved before any work was scheduled.
    #[error("Master peer {peer_id} misbehaved: {error}")]
    MasterPeer {
        /// The master peer.
        peer_id: PeerId,
        /// What it did.
        #[source]
        error: DownloadError,
    },
    /// A header failed the seal check at commit time.
    ///
    /// The session does not end on it: the supplier is banned and the headers are fetched again.
    #[error("Invalid seal on block #{number} ({hash}): {error}")]
    InvalidSeal {
        /// Number of the block.
        number: BlockNumber,
        /// Hash of the block.
        hash: BlockHash,
        /// The peer that served the header, if known.
        peer_id: Option<PeerId>,
        /// The consensus error.
        #[source]
        error: ConsensusError,
    },
    /// Executing a block produced a state different from the one its header declares.
    #[error("State root mismatch in block #{number}: expected {expected}, got {got}.")]
    StateRootMismatch {
        /// Number of the block.
        number: BlockNumber,
        /// The root declared by the header.
        expected: B256,
        /// The root produced by execution.
        got: B256,
        /// The peer that served the header, if known.
        peer_id: Option<PeerId>,
    },
    /// The downloaded pivot state does not hash to the pivot header's state root.
    #[error("Pivot state of block #{number} is inconsistent: node {expected} hashes to {got}.")]
    PivotStateMismatch {
        /// Number of the pivot block.
        number: BlockNumber,
        /// The hash the node is stored under.
        expected: B256,
        /// The hash of the stored data.
        got: B256,
    },
    /// A state node with a valid hash could not be decoded.
    #[error("State node {hash} is corrupt.")]
    CorruptNode {
        /// The node hash.
        hash: B256,
    },
    /// A work item ran out of retries.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A block failed to execute.
    #[error("Failed to execute block #{number}: {error}")]
    Execution {
        /// Number of the block.
        number: BlockNumber,
        /// The execution error.
        #[source]
        error: BlockExecutionError,
    },
    /// The chain store failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl SyncError {
    /// Returns `true` if the error ends the session without any point in retrying it against the
    /// same peers.
    ///
    /// Cancellation and a misbehaving master only abort the session: the offending peer is
    /// banned and the next session can succeed with the others. An invalid seal is recovered
    /// from within the session.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::MasterPeer { .. } | Self::InvalidSeal { .. })
    }

    /// Returns `true` if the error shows that the downloaded state can not be trusted.
    ///
    /// A fast sync session failing this way makes later sessions fall back to full sync.
    pub const fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::StateRootMismatch { .. } |
                Self::PivotStateMismatch { .. } |
                Self::CorruptNode { .. }
        )
    }

    /// The peer that caused the error and must be banned, if any.
    pub const fn offender(&self) -> Option<PeerId> {
        match self {
            Self::MasterPeer { peer_id, .. } => Some(*peer_id),
            Self::InvalidSeal { peer_id, .. } | Self::StateRootMismatch { peer_id, .. } => {
                *peer_id
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbc_downloaders::WorkKey;

    #[test]
    fn classification() {
        let peer_id = PeerId::with_last_byte(1);
        assert!(!SyncError::Cancelled.is_fatal());
        assert!(SyncError::NoPeers.is_fatal());
        assert!(SyncError::Queue(QueueError::RetriesExhausted(WorkKey::Body(B256::ZERO))).is_fatal());

        let seal = SyncError::InvalidSeal {
            number: 1,
            hash: B256::ZERO,
            peer_id: Some(peer_id),
            error: ConsensusError::InvalidSeal { hash: B256::ZERO },
        };
        assert!(!seal.is_fatal());
        assert_eq!(seal.offender(), Some(peer_id));

        let root = SyncError::StateRootMismatch {
            number: 1,
            expected: B256::ZERO,
            got: B256::ZERO,
            peer_id: None,
        };
        assert!(root.is_fatal());
        assert!(root.is_state_error());
        assert_eq!(root.offender(), None);
    }
}
