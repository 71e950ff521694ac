//! Ethereum protocol-related constants

use alloy_primitives::{b256, B256};

/// Keccak256 over the RLP encoding of an empty list (`0xc0`).
///
/// This is the transactions root, ommers hash and receipts root of a block that carries no
/// transactions, no ommers and therefore no receipts.
pub const EMPTY_LIST_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[test]
    fn empty_list_hash() {
        assert_eq!(keccak256([alloy_rlp::EMPTY_LIST_CODE]), EMPTY_LIST_HASH);
    }
}
