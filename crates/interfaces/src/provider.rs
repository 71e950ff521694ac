use fbc_primitives::{
    BlockHash, BlockNumber, Bytes, Head, Receipt, SealedBlock, SealedHeader, B256, U256,
};

/// Result alias for [`ProviderError`].
pub type ProviderResult<T> = Result<T, ProviderError>;

/// A plain key-value capability over the node database.
///
/// The sync engine uses it to persist content-addressed state trie nodes, keyed by their hash.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait KeyValueStore: Send + Sync {
    /// Returns true if the key is present.
    fn has(&self, key: &B256) -> ProviderResult<bool>;

    /// Returns the value stored under the key, if any.
    fn get(&self, key: &B256) -> ProviderResult<Option<Bytes>>;

    /// Stores the value under the key, overwriting any previous value.
    fn put(&self, key: B256, value: Bytes) -> ProviderResult<()>;

    /// Deletes the key.
    fn delete(&self, key: &B256) -> ProviderResult<()>;
}

/// Block storage used by the sync engine.
///
/// Every write method is atomic per block: a block is either stored with all of its parts or not
/// at all.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait ChainStore: KeyValueStore {
    /// Returns the current canonical head, i.e. the highest block with full state.
    fn head(&self) -> ProviderResult<Head>;

    /// Returns the header with the given hash, canonical or not.
    fn header(&self, hash: &BlockHash) -> ProviderResult<Option<SealedHeader>>;

    /// Returns the hash of the canonical block at the given height.
    fn canonical_hash(&self, number: BlockNumber) -> ProviderResult<Option<BlockHash>>;

    /// Returns the total difficulty of the block with the given hash.
    fn total_difficulty(&self, hash: &BlockHash) -> ProviderResult<Option<U256>>;

    /// Returns true if the block (header and body) is stored.
    fn has_block(&self, hash: &BlockHash) -> ProviderResult<bool>;

    /// Writes a fully executed block.
    ///
    /// The parent must be stored and the block's state root must be present in the key-value
    /// store. The block becomes the new head if its total difficulty exceeds the head's.
    fn write_block(&self, block: SealedBlock, receipts: Vec<Receipt>) -> ProviderResult<()>;

    /// Writes a block together with downloaded receipts, without state and without moving the
    /// head.
    fn write_fast_block(&self, block: SealedBlock, receipts: Vec<Receipt>) -> ProviderResult<()>;

    /// Makes the stored block with the given hash the canonical head.
    ///
    /// The block's state must be present.
    fn commit_head(&self, hash: BlockHash) -> ProviderResult<()>;
}

/// Storage errors.
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Block {hash} is not stored.")]
    UnknownBlock { hash: BlockHash },
    #[error("Parent {parent_hash} of block {number} is not stored.")]
    UnknownParent { number: BlockNumber, parent_hash: BlockHash },
    #[error("State {root} is not stored.")]
    MissingState { root: B256 },
    #[error("Database error: {0}")]
    Database(String),
}
