use crate::consensus::ConsensusError;
use fbc_primitives::{BlockNumber, B256};
use tokio::sync::{mpsc, oneshot};

/// Result alias for result of a request.
pub type RequestResult<T> = Result<T, RequestError>;

/// Error variants that can happen when sending requests to a peer.
#[derive(Debug, thiserror::Error, Clone, Copy, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum RequestError {
    #[error("Closed channel to the peer.")]
    ChannelClosed,
    #[error("Connection to a peer dropped while handling the request.")]
    ConnectionDropped,
    #[error("Request timed out while awaiting response.")]
    Timeout,
    #[error("Received bad response.")]
    BadResponse,
    #[error("Request was cancelled.")]
    Cancelled,
    #[error("Peer is not connected.")]
    UnknownPeer,
}

// === impl RequestError ===

impl RequestError {
    /// Indicates whether this error is retryable or fatal.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionDropped | Self::UnknownPeer)
    }
}

impl<T> From<mpsc::error::SendError<T>> for RequestError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<oneshot::error::RecvError> for RequestError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}

/// The download result type
pub type DownloadResult<T> = Result<T, DownloadError>;

/// The downloader error type.
///
/// Errors split into two families: those that prove the serving peer sent invalid data
/// ([`DownloadError::is_peer_fault`]) and those that are plain bad luck (timeouts, short or late
/// responses) and only warrant a retry.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /* ==================== HEADER ERRORS ==================== */
    /// Header validation failed
    #[error("Failed to validate header {hash} ({number}). Details: {error}.")]
    HeaderValidation {
        /// Hash of header failing validation
        hash: B256,
        /// Number of header failing validation
        number: BlockNumber,
        /// The details of validation failure
        #[source]
        error: ConsensusError,
    },
    /// Error when checking that the current header has the parent's hash as the parent_hash
    /// field, and that they have sequential block numbers.
    #[error("Headers did not match, current number: {header_number} / current hash: {header_hash}, parent number: {parent_number} / parent_hash: {parent_hash}")]
    MismatchedHeaders {
        /// The header number being evaluated
        header_number: BlockNumber,
        /// The header hash being evaluated
        header_hash: B256,
        /// The parent number being evaluated
        parent_number: BlockNumber,
        /// The parent hash being evaluated
        parent_hash: B256,
    },
    /// A header range did not end in the header it was anchored to.
    ///
    /// The serving peer and the peer that supplied the anchor disagree on the chain, so this
    /// alone does not prove either of them wrong.
    #[error("Header {number} hashes to {received}, expected anchor {expected}.")]
    AnchorMismatch {
        /// Number of the anchored header
        number: BlockNumber,
        /// Hash that was received
        received: B256,
        /// Hash of the anchor
        expected: B256,
    },
    /// An anchored range was answered only in part, so the anchor could not be checked.
    #[error("Received {received} of {expected} headers of an anchored range.")]
    IncompleteRange {
        /// How many headers we received.
        received: u64,
        /// Length of the range.
        expected: u64,
    },
    /// A header requested by hash hashes to something else.
    #[error("Requested header {expected}, received {received}.")]
    UnrequestedHeader {
        /// Hash of the received header
        received: B256,
        /// The requested hash
        expected: B256,
    },
    /// Received a response to a request with unexpected start block
    #[error("Headers response starts at unexpected block: {received:?}. Expected {expected:?}.")]
    HeadersResponseStartBlockMismatch {
        /// The block number of the received tip
        received: u64,
        /// The hash of the expected tip
        expected: u64,
    },
    /// Received more headers than requested.
    #[error("Received more headers than requested: {received:?}. Expected {expected:?}.")]
    TooManyHeaders {
        /// How many headers we received.
        received: u64,
        /// How many headers we expected.
        expected: u64,
    },
    /* ==================== BODIES ERRORS ==================== */
    /// Block validation failed
    #[error("Failed to validate body for header {hash}. Details: {error}.")]
    BodyValidation {
        /// Hash of header failing validation
        hash: B256,
        /// The details of validation failure
        #[source]
        error: ConsensusError,
    },
    /// Received more bodies or receipts than requested.
    #[error("Received more items than requested. Expected: {expected}. Received: {received}")]
    TooManyItems {
        /// How many items we received.
        received: usize,
        /// How many items we expected.
        expected: usize,
    },
    /* ==================== RECEIPTS ERRORS ==================== */
    /// Receipts did not match the receipts root of the header.
    #[error("Receipts for block {hash} hash to {got}, expected {expected}.")]
    ReceiptsRootMismatch {
        /// Hash of the block
        hash: B256,
        /// The computed root
        got: B256,
        /// The root from the header
        expected: B256,
    },
    /* ==================== STATE ERRORS ==================== */
    /// A node was delivered that was never requested from the peer.
    #[error("Received unrequested state node {hash}.")]
    UnrequestedNode {
        /// Hash of the received node
        hash: B256,
    },
    /* ==================== COMMON ERRORS ==================== */
    /// A delivery that does not match any item in flight for the peer.
    #[error("Stale or duplicate delivery.")]
    StaleDelivery,
    /// Timed out while waiting for request id response.
    #[error("Timed out while waiting for response.")]
    Timeout,
    /// Received empty response while expecting non empty
    #[error("Received empty response.")]
    EmptyResponse,
    /// Error while executing the request.
    #[error(transparent)]
    RequestError(#[from] RequestError),
}

impl DownloadError {
    /// Returns true if the error proves the peer served invalid data.
    ///
    /// Such peers are dropped and banned for the rest of the sync session.
    pub const fn is_peer_fault(&self) -> bool {
        match self {
            Self::HeaderValidation { .. } |
            Self::MismatchedHeaders { .. } |
            Self::UnrequestedHeader { .. } |
            Self::HeadersResponseStartBlockMismatch { .. } |
            Self::TooManyHeaders { .. } |
            Self::BodyValidation { .. } |
            Self::TooManyItems { .. } |
            Self::ReceiptsRootMismatch { .. } |
            Self::UnrequestedNode { .. } => true,
            Self::RequestError(err) => matches!(err, RequestError::BadResponse),
            Self::AnchorMismatch { .. } |
            Self::IncompleteRange { .. } |
            Self::StaleDelivery |
            Self::Timeout |
            Self::EmptyResponse => false,
        }
    }

    /// Returns bool indicating whether this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout |
            Self::EmptyResponse |
            Self::IncompleteRange { .. } |
            Self::StaleDelivery => true,
            Self::RequestError(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_download_errors() {
        let mismatch = DownloadError::MismatchedHeaders {
            header_number: 2,
            header_hash: B256::ZERO,
            parent_number: 1,
            parent_hash: B256::ZERO,
        };
        assert!(mismatch.is_peer_fault());
        assert!(!mismatch.is_retryable());

        assert!(!DownloadError::Timeout.is_peer_fault());
        assert!(DownloadError::Timeout.is_retryable());

        // neither side of an anchor dispute is proven wrong by it
        let anchor = DownloadError::AnchorMismatch {
            number: 8,
            received: B256::ZERO,
            expected: B256::repeat_byte(1),
        };
        assert!(!anchor.is_peer_fault());
        let short = DownloadError::IncompleteRange { received: 2, expected: 4 };
        assert!(!short.is_peer_fault());
        assert!(short.is_retryable());
        let wrong = DownloadError::UnrequestedHeader {
            received: B256::ZERO,
            expected: B256::repeat_byte(1),
        };
        assert!(wrong.is_peer_fault());

        let bad: DownloadError = RequestError::BadResponse.into();
        assert!(bad.is_peer_fault());
        let dropped: DownloadError = RequestError::ConnectionDropped.into();
        assert!(!dropped.is_peer_fault());
        assert!(dropped.is_retryable());
    }
}
