use fbc_primitives::{BlockBody, BlockHash, BlockNumber, SealedHeader, B256, U256};
use std::fmt::Debug;

/// Consensus is a protocol that chooses canonical chain.
///
/// The sync engine only asks two things of it: a cheap structural check that runs on every
/// downloaded header, and the (possibly expensive) seal check that is deferred until a header is
/// about to be committed.
#[auto_impl::auto_impl(&, Arc)]
pub trait Consensus: Debug + Send + Sync {
    /// Validate if header is correct and follows consensus specification.
    ///
    /// This is the cheap check: it must not verify the seal.
    ///
    /// **This should not be called for the genesis block**.
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), ConsensusError>;

    /// Validate the seal of the header (proof-of-work, authority signature, ...).
    fn validate_seal(&self, header: &SealedHeader) -> Result<(), ConsensusError>;

    /// Validate a block body against the commitments of its header, without executing it.
    fn validate_body(&self, header: &SealedHeader, body: &BlockBody) -> Result<(), ConsensusError> {
        let tx_root = body.calculate_tx_root();
        if tx_root != header.transactions_root {
            return Err(ConsensusError::BodyTransactionRootDiff {
                got: tx_root,
                expected: header.transactions_root,
            })
        }
        let ommers_hash = body.calculate_ommers_root();
        if ommers_hash != header.ommers_hash {
            return Err(ConsensusError::BodyOmmersHashDiff {
                got: ommers_hash,
                expected: header.ommers_hash,
            })
        }
        Ok(())
    }
}

/// Consensus Errors
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum ConsensusError {
    #[error("Block used gas ({gas_used}) is greater than gas limit ({gas_limit}).")]
    HeaderGasUsedExceedsGasLimit { gas_used: u64, gas_limit: u64 },
    #[error("Block ommer hash ({got}) is different from expected: ({expected})")]
    BodyOmmersHashDiff { got: B256, expected: B256 },
    #[error("Block transaction root ({got}) is different from expected ({expected})")]
    BodyTransactionRootDiff { got: B256, expected: B256 },
    #[error("Block receipts root ({got}) is different from expected ({expected})")]
    BodyReceiptsRootDiff { got: B256, expected: B256 },
    #[error("Block number {block_number} does not match parent block number {parent_block_number}")]
    ParentBlockNumberMismatch { parent_block_number: BlockNumber, block_number: BlockNumber },
    #[error("Parent hash {got_parent_hash} does not match the expected {expected_parent_hash}")]
    ParentHashMismatch { expected_parent_hash: B256, got_parent_hash: B256 },
    #[error("Block timestamp {timestamp} is in past in comparison with parent timestamp {parent_timestamp}.")]
    TimestampIsInPast { parent_timestamp: u64, timestamp: u64 },
    #[error("Block gas limit {child_gas_limit} changed too much from parent {parent_gas_limit}.")]
    GasLimitInvalidChange { parent_gas_limit: u64, child_gas_limit: u64 },
    #[error("Block difficulty {difficulty} is invalid.")]
    InvalidDifficulty { difficulty: U256 },
    #[error("Extra data {len} exceeds max length.")]
    ExtraDataExceedsMax { len: usize },
    #[error("Extra data of {len} bytes is too short to carry an authority seal.")]
    MissingSignerSeal { len: usize },
    #[error("Invalid seal for block {hash}.")]
    InvalidSeal { hash: BlockHash },
}

