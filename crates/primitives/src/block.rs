use crate::{BlockHash, BlockNumber, Header, SealedHeader};
use alloy_primitives::{keccak256, Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use std::ops::Deref;

/// A response to `GetBlockBodies`, containing bodies if any bodies were found.
///
/// Transactions are kept as opaque encoded payloads: synchronization only needs to commit to them,
/// interpreting them is the executor's job.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BlockBody {
    /// Transactions in the block
    pub transactions: Vec<Bytes>,
    /// Uncle headers for the given block
    pub ommers: Vec<Header>,
}

impl BlockBody {
    /// Calculate the transaction root for the block body.
    pub fn calculate_tx_root(&self) -> B256 {
        keccak256(alloy_rlp::encode(&self.transactions))
    }

    /// Calculate the ommers root for the block body.
    pub fn calculate_ommers_root(&self) -> B256 {
        keccak256(alloy_rlp::encode(&self.ommers))
    }

    /// Returns true if the body commits to the given header's transaction and ommer roots.
    pub fn matches(&self, header: &Header) -> bool {
        self.calculate_tx_root() == header.transactions_root &&
            self.calculate_ommers_root() == header.ommers_hash
    }
}

/// A full block with its header hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealedBlock {
    /// Locked block header.
    pub header: SealedHeader,
    /// Transactions with signatures.
    pub body: Vec<Bytes>,
    /// Ommer/uncle headers
    pub ommers: Vec<Header>,
}

impl SealedBlock {
    /// Create a new sealed block instance using the sealed header and block body.
    pub fn new(header: SealedHeader, body: BlockBody) -> Self {
        let BlockBody { transactions, ommers } = body;
        Self { header, body: transactions, ommers }
    }

    /// Header hash.
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Block number.
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Returns the body of this block.
    pub fn block_body(&self) -> BlockBody {
        BlockBody { transactions: self.body.clone(), ommers: self.ommers.clone() }
    }
}

impl Deref for SealedBlock {
    type Target = SealedHeader;
    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EMPTY_LIST_HASH;

    #[test]
    fn empty_body_roots() {
        let body = BlockBody::default();
        assert_eq!(body.calculate_tx_root(), EMPTY_LIST_HASH);
        assert_eq!(body.calculate_ommers_root(), EMPTY_LIST_HASH);
    }

    #[test]
    fn body_matches_header() {
        let body = BlockBody {
            transactions: vec![Bytes::from_static(b"tx-1"), Bytes::from_static(b"tx-2")],
            ommers: vec![],
        };
        let mut header = Header {
            transactions_root: body.calculate_tx_root(),
            ommers_hash: EMPTY_LIST_HASH,
            ..Default::default()
        };
        assert!(body.matches(&header));

        header.transactions_root = EMPTY_LIST_HASH;
        assert!(!body.matches(&header));
    }
}
