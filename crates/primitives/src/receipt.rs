use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// Ethereum Log
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Log {
    /// Contract that emitted this log.
    pub address: Address,
    /// Topics of the log. The number of logs depend on what `LOG` opcode is used.
    pub topics: Vec<B256>,
    /// Arbitrary length data.
    pub data: Bytes,
}

/// Receipt containing result of transaction execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Receipt {
    /// If transaction is executed successfully.
    pub success: bool,
    /// Gas used
    pub cumulative_gas_used: u64,
    /// Log send from contracts.
    pub logs: Vec<Log>,
}

/// Calculates the receipts root of a block from its receipts.
///
/// An empty receipt list commits to [`EMPTY_LIST_HASH`](crate::EMPTY_LIST_HASH).
pub fn receipts_root(receipts: &[Receipt]) -> B256 {
    let mut out = Vec::new();
    alloy_rlp::encode_list::<Receipt, Receipt>(receipts, &mut out);
    keccak256(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EMPTY_LIST_HASH;

    #[test]
    fn receipts_root_commits_to_content() {
        assert_eq!(receipts_root(&[]), EMPTY_LIST_HASH);

        let a = Receipt { success: true, cumulative_gas_used: 21_000, logs: vec![] };
        let b = Receipt { success: false, ..a.clone() };
        assert_ne!(receipts_root(&[a.clone()]), receipts_root(&[b]));
        assert_eq!(receipts_root(&[a.clone()]), receipts_root(&[a.clone()]));

        // the root commits to the list, not to the concatenated items
        let mut list = Vec::new();
        alloy_rlp::encode_list::<Receipt, Receipt>(&[a.clone(), a.clone()], &mut list);
        assert_eq!(receipts_root(&[a.clone(), a]), keccak256(list));
    }
}
