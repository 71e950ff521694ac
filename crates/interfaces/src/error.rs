/// Result alias for [`FbcError`].
pub type FbcResult<T> = Result<T, FbcError>;

/// Core error variants possible when interacting with the blockchain.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FbcError {
    #[error(transparent)]
    Execution(#[from] crate::executor::BlockExecutionError),

    #[error(transparent)]
    Consensus(#[from] crate::consensus::ConsensusError),

    #[error(transparent)]
    Provider(#[from] crate::provider::ProviderError),

    #[error(transparent)]
    Request(#[from] crate::p2p::error::RequestError),

    #[error("{0}")]
    Custom(String),
}
