use alloy_primitives::{keccak256, Bytes, B256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};

/// A node of the content-addressed state trie.
///
/// A node is identified by the keccak hash of its RLP encoding. Interior nodes reference their
/// children by hash, which is what makes the trie downloadable from untrusted peers: every node
/// received can be checked against the hash it was requested by, and its children become
/// requestable as soon as it is.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TrieNode {
    /// Hashes of the child nodes.
    pub children: Vec<B256>,
    /// Value stored at this node.
    pub value: Bytes,
}

impl TrieNode {
    /// Creates a leaf node.
    pub fn leaf(value: impl Into<Bytes>) -> Self {
        Self { children: Vec::new(), value: value.into() }
    }

    /// Returns the RLP encoding of the node, which is what is stored and served.
    pub fn encoded(&self) -> Bytes {
        alloy_rlp::encode(self).into()
    }

    /// Hash of the node.
    pub fn hash_slow(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Decodes a node from its stored or served encoding.
    pub fn decode_raw(mut data: &[u8]) -> alloy_rlp::Result<Self> {
        Self::decode(&mut data)
    }
}
