#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Commonly used types in fbc.
//!
//! This crate contains the block, header, receipt and state-trie types that the synchronization
//! engine moves around, together with the commitments (`keccak256` over RLP) used to verify
//! them against a header.

mod block;
pub mod constants;
mod header;
mod peer;
mod receipt;
mod trie;

pub use block::{BlockBody, SealedBlock};
pub use constants::EMPTY_LIST_HASH;
pub use header::{BlockHashOrNumber, Head, Header, HeadersDirection, SealedHeader};
pub use peer::PeerId;
pub use receipt::{receipts_root, Log, Receipt};
pub use trie::TrieNode;

pub use alloy_primitives::{keccak256, Address, Bytes, B256, B512, U256};

/// A block number.
pub type BlockNumber = u64;

/// A block hash.
pub type BlockHash = B256;
