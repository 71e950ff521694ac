use crate::{BlockHash, BlockNumber, EMPTY_LIST_HASH};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use std::ops::Deref;

/// Describes the current head block.
///
/// The head block is the highest fully synced block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Head {
    /// The number of the head block.
    pub number: BlockNumber,
    /// The hash of the head block.
    pub hash: BlockHash,
    /// The total difficulty at the head block.
    pub total_difficulty: U256,
}

/// Block header
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, RlpEncodable, RlpDecodable)]
pub struct Header {
    /// The Keccak 256-bit hash of the parent block's header, in its entirety.
    pub parent_hash: B256,
    /// The Keccak 256-bit hash of the ommers list portion of this block.
    pub ommers_hash: B256,
    /// The 160-bit address to which all fees collected from the successful mining of this block
    /// be transferred.
    pub beneficiary: Address,
    /// The Keccak 256-bit hash of the root node of the state trie, after all transactions are
    /// executed and finalisations applied.
    pub state_root: B256,
    /// The Keccak 256-bit hash of the list of transactions in the block.
    pub transactions_root: B256,
    /// The Keccak 256-bit hash of the list of receipts produced by the block's transactions.
    pub receipts_root: B256,
    /// A scalar value corresponding to the difficulty level of this block.
    pub difficulty: U256,
    /// A scalar value equal to the number of ancestor blocks. The genesis block has a number of
    /// zero.
    pub number: BlockNumber,
    /// A scalar value equal to the current limit of gas expenditure per block.
    pub gas_limit: u64,
    /// A scalar value equal to the total gas used in transactions in this block.
    pub gas_used: u64,
    /// Unix timestamp of the block's inception.
    pub timestamp: u64,
    /// Arbitrary byte array containing data relevant to this block.
    pub extra_data: Bytes,
    /// Proof-of-work mix digest, or the vanity/seal slot for proof-of-authority.
    pub mix_hash: B256,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl Header {
    /// Returns true if the block carries neither transactions nor ommers.
    ///
    /// Bodies of empty blocks never need to be downloaded.
    pub fn is_empty(&self) -> bool {
        self.transactions_root == EMPTY_LIST_HASH && self.ommers_hash == EMPTY_LIST_HASH
    }

    /// Returns true if the block produced no receipts.
    pub fn has_empty_receipts(&self) -> bool {
        self.receipts_root == EMPTY_LIST_HASH
    }

    /// Heavy function that will calculate hash of data and will *not* save the change to
    /// metadata. Use [`Header::seal_slow`] and unlock if you need the hash to be persistent.
    pub fn hash_slow(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Calculate the hash and seal the header so that it can't be changed.
    pub fn seal_slow(self) -> SealedHeader {
        let hash = self.hash_slow();
        SealedHeader::new(self, hash)
    }

    /// Seal the header with a known hash.
    ///
    /// WARNING: This method does not perform validation whether the hash is correct.
    pub fn seal(self, hash: B256) -> SealedHeader {
        SealedHeader::new(self, hash)
    }
}

/// A [`Header`] that is sealed at a precalculated hash, use [`SealedHeader::unseal()`] if you
/// want to modify the header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SealedHeader {
    header: Header,
    hash: BlockHash,
}

impl SealedHeader {
    /// Creates the sealed header with the corresponding block hash.
    #[inline]
    pub const fn new(header: Header, hash: BlockHash) -> Self {
        Self { header, hash }
    }

    /// Returns the sealed header's hash.
    #[inline]
    pub const fn hash(&self) -> BlockHash {
        self.hash
    }

    /// Returns the wrapped header.
    #[inline]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Extract the raw header that can be modified.
    pub fn unseal(self) -> Header {
        self.header
    }

    /// Returns the [`BlockHashOrNumber`] pair of this header.
    pub fn num_hash(&self) -> (BlockNumber, BlockHash) {
        (self.header.number, self.hash)
    }
}

impl Deref for SealedHeader {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

impl AsRef<Header> for SealedHeader {
    fn as_ref(&self) -> &Header {
        &self.header
    }
}

/// Direction of a headers request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HeadersDirection {
    /// Rising block number.
    #[default]
    Rising,
    /// Falling block number.
    Falling,
}

/// Either a block hash _or_ a block number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockHashOrNumber {
    /// A block hash
    Hash(B256),
    /// A block number
    Number(u64),
}

impl From<B256> for BlockHashOrNumber {
    fn from(value: B256) -> Self {
        Self::Hash(value)
    }
}

impl From<u64> for BlockHashOrNumber {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}
