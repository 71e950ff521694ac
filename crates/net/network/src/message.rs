//! Protocol messages exchanged with remote peers.
//!
//! The wire encoding is handled by the transport; the sync engine only deals with the decoded
//! request and response variants defined here.

use fbc_interfaces::p2p::{RequestId, WorkKind};
use fbc_primitives::{
    BlockBody, BlockHash, BlockHashOrNumber, BlockNumber, Bytes, Header, HeadersDirection,
    PeerId, Receipt, SealedBlock, B256, U256,
};

/// A request for a range of block headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBlockHeaders {
    /// The block number or hash the range starts at.
    pub start_block: BlockHashOrNumber,
    /// Maximum number of headers to return.
    pub limit: u64,
    /// Number of blocks to skip between consecutive headers.
    pub skip: u32,
    /// Direction of the range.
    pub direction: HeadersDirection,
}

impl GetBlockHeaders {
    /// A request for `limit` consecutive headers in rising order starting at `start`.
    pub fn rising(start: BlockNumber, limit: u64) -> Self {
        Self {
            start_block: start.into(),
            limit,
            skip: 0,
            direction: HeadersDirection::Rising,
        }
    }

    /// A request for the single header with the given hash.
    pub fn by_hash(hash: BlockHash) -> Self {
        Self { start_block: hash.into(), limit: 1, skip: 0, direction: HeadersDirection::Rising }
    }
}

/// All request variants the sync engine sends to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthRequest {
    /// Request block headers.
    GetBlockHeaders(GetBlockHeaders),
    /// Request block bodies by block hash.
    GetBlockBodies(Vec<BlockHash>),
    /// Request block receipts by block hash.
    GetReceipts(Vec<BlockHash>),
    /// Request state trie nodes by node hash.
    GetNodeData(Vec<B256>),
}

impl EthRequest {
    /// The kind of data this request asks for.
    pub const fn kind(&self) -> WorkKind {
        match self {
            Self::GetBlockHeaders(_) => WorkKind::Headers,
            Self::GetBlockBodies(_) => WorkKind::Bodies,
            Self::GetReceipts(_) => WorkKind::Receipts,
            Self::GetNodeData(_) => WorkKind::State,
        }
    }

    /// Maximum number of items a well behaved peer returns for this request.
    pub fn max_items(&self) -> usize {
        match self {
            Self::GetBlockHeaders(req) => req.limit as usize,
            Self::GetBlockBodies(hashes) |
            Self::GetReceipts(hashes) |
            Self::GetNodeData(hashes) => hashes.len(),
        }
    }
}

/// All response variants a peer can send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthResponse {
    /// Block headers.
    BlockHeaders(Vec<Header>),
    /// Block bodies, in request order.
    BlockBodies(Vec<BlockBody>),
    /// Receipts of each requested block, in request order.
    Receipts(Vec<Vec<Receipt>>),
    /// Raw state trie nodes, in any order.
    NodeData(Vec<Bytes>),
}

impl EthResponse {
    /// The kind of data this response carries.
    pub const fn kind(&self) -> WorkKind {
        match self {
            Self::BlockHeaders(_) => WorkKind::Headers,
            Self::BlockBodies(_) => WorkKind::Bodies,
            Self::Receipts(_) => WorkKind::Receipts,
            Self::NodeData(_) => WorkKind::State,
        }
    }

    /// Number of items in the response.
    pub fn len(&self) -> usize {
        match self {
            Self::BlockHeaders(items) => items.len(),
            Self::BlockBodies(items) => items.len(),
            Self::Receipts(items) => items.len(),
            Self::NodeData(items) => items.len(),
        }
    }

    /// Returns true if the response carries no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this response answers the given request.
    pub fn answers(&self, request: &EthRequest) -> bool {
        self.kind() == request.kind()
    }
}

/// The handshake information a peer advertises when the session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Negotiated protocol version.
    pub version: u8,
    /// Total difficulty of the peer's best chain.
    pub total_difficulty: U256,
    /// Hash of the peer's best block.
    pub head: B256,
    /// Genesis hash of the peer's chain.
    pub genesis: B256,
}

/// A block hash announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHashNumber {
    /// Hash of the announced block.
    pub hash: B256,
    /// Number of the announced block.
    pub number: BlockNumber,
}

/// A fully propagated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlock {
    /// The block.
    pub block: SealedBlock,
    /// Total difficulty of the chain ending in this block, as claimed by the peer.
    pub td: U256,
}

/// Events emitted by the transport layer and consumed by the protocol handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A session with a new peer was established.
    SessionEstablished {
        /// The remote peer.
        peer_id: PeerId,
        /// The handshake status.
        status: Status,
    },
    /// The session with a peer closed.
    SessionClosed {
        /// The remote peer.
        peer_id: PeerId,
    },
    /// A peer announced new block hashes.
    NewBlockHashes {
        /// The announcing peer.
        peer_id: PeerId,
        /// The announced blocks.
        hashes: Vec<BlockHashNumber>,
    },
    /// A peer propagated a full block.
    NewBlock {
        /// The propagating peer.
        peer_id: PeerId,
        /// The block.
        block: NewBlock,
    },
    /// A peer answered a request.
    Response {
        /// The answering peer.
        peer_id: PeerId,
        /// The id of the request this response answers.
        request_id: RequestId,
        /// The response.
        response: EthResponse,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_answers_request_of_same_kind() {
        let req = EthRequest::GetReceipts(vec![B256::ZERO, B256::with_last_byte(1)]);
        assert_eq!(req.max_items(), 2);
        assert!(EthResponse::Receipts(vec![]).answers(&req));
        assert!(!EthResponse::BlockBodies(vec![]).answers(&req));
        assert_eq!(EthRequest::GetBlockHeaders(GetBlockHeaders::rising(5, 10)).max_items(), 10);
    }
}
