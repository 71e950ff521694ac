use crate::consensus::{Consensus, ConsensusError};
use fbc_primitives::{BlockHash, SealedHeader};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, Ordering},
};

/// Consensus engine implementation for testing
///
/// Headers are checked for linkage only; seals are valid unless flagged.
#[derive(Debug, Default)]
pub struct TestConsensus {
    /// Flag whether the header validation should purposefully fail
    fail_validation: AtomicBool,
    /// Headers whose seal is reported invalid
    invalid_seals: Mutex<HashSet<BlockHash>>,
}

impl TestConsensus {
    /// Get the failed validation flag
    pub fn fail_validation(&self) -> bool {
        self.fail_validation.load(Ordering::SeqCst)
    }

    /// Update the validation flag
    pub fn set_fail_validation(&self, val: bool) {
        self.fail_validation.store(val, Ordering::SeqCst)
    }

    /// Marks the seal of the given header as invalid.
    pub fn set_invalid_seal(&self, hash: BlockHash) {
        self.invalid_seals.lock().insert(hash);
    }
}

impl Consensus for TestConsensus {
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), ConsensusError> {
        if self.fail_validation() {
            return Err(ConsensusError::InvalidDifficulty { difficulty: header.difficulty })
        }
        if header.parent_hash != parent.hash() {
            return Err(ConsensusError::ParentHashMismatch {
                expected_parent_hash: parent.hash(),
                got_parent_hash: header.parent_hash,
            })
        }
        if header.number != parent.number + 1 {
            return Err(ConsensusError::ParentBlockNumberMismatch {
                parent_block_number: parent.number,
                block_number: header.number,
            })
        }
        Ok(())
    }

    fn validate_seal(&self, header: &SealedHeader) -> Result<(), ConsensusError> {
        if self.invalid_seals.lock().contains(&header.hash()) {
            return Err(ConsensusError::InvalidSeal { hash: header.hash() })
        }
        Ok(())
    }
}
