use crate::provider::KeyValueStore;
use fbc_primitives::{Bytes, Receipt, SealedBlock, B256};
use std::fmt::Debug;

/// Takes a block and applies it on top of the given parent state.
///
/// Implementations must not write to the store: the resulting trie nodes are returned in the
/// [`ExecutionOutcome`] and persisted by the caller once the outcome has been checked against
/// the block header.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait BlockExecutor: Debug + Send + Sync {
    /// Execute the block on top of the state identified by `parent_state_root`.
    fn execute(
        &self,
        block: &SealedBlock,
        parent_state_root: B256,
        state: &dyn KeyValueStore,
    ) -> Result<ExecutionOutcome, BlockExecutionError>;
}

/// Result of executing a single block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Receipts produced by the block's transactions, in order.
    pub receipts: Vec<Receipt>,
    /// Root of the post-state trie.
    pub state_root: B256,
    /// Trie nodes created by the block, keyed by their hash.
    pub trie_nodes: Vec<(B256, Bytes)>,
}

/// BlockExecutor Errors
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockExecutionError {
    #[error("Parent state {root} is not available.")]
    MissingState { root: B256 },
    #[error("State node {hash} could not be decoded.")]
    CorruptState { hash: B256 },
    #[error("Block state root ({got}) is different from expected ({expected})")]
    StateRootDiff { got: B256, expected: B256 },
    #[error("Block receipts root ({got}) is different from expected ({expected})")]
    ReceiptsRootDiff { got: B256, expected: B256 },
    #[error("Transaction {index} of block {block} is invalid.")]
    InvalidTransaction { block: B256, index: usize },
    #[error("Fatal internal error: {0}")]
    Internal(String),
}
