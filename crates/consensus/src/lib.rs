#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Consensus engines consumed by the sync engine.
//!
//! The set of engines is closed: the node picks one [`ConsensusEngine`] variant at startup and
//! hands it to the synchronizer as an `Arc<dyn Consensus>`.

use fbc_interfaces::consensus::{Consensus, ConsensusError};
use fbc_primitives::{BlockNumber, SealedHeader};

pub mod verification;

use verification::{
    validate_header_regarding_parent, validate_header_standalone, validate_poa_header,
    validate_poa_seal, validate_pow_seal, MAXIMUM_EXTRA_DATA_SIZE,
};

/// The consensus engine of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEngine {
    /// Proof-of-work: the seal is a nonce whose digest meets the difficulty target.
    ProofOfWork,
    /// Proof-of-authority: blocks are sealed by authorised signers at a fixed period.
    ProofOfAuthority {
        /// Minimum number of seconds between two blocks.
        period: u64,
    },
    /// Accepts every seal, optionally failing from a given block on. Used for testing.
    Fake {
        /// Seals of blocks at or above this number are rejected.
        fail_at: Option<BlockNumber>,
    },
}

impl ConsensusEngine {
    /// A fake engine that accepts everything.
    pub const fn fake() -> Self {
        Self::Fake { fail_at: None }
    }
}

impl Consensus for ConsensusEngine {
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), ConsensusError> {
        validate_header_standalone(header)?;
        validate_header_regarding_parent(parent, header)?;
        match self {
            Self::ProofOfWork => {
                if header.extra_data.len() > MAXIMUM_EXTRA_DATA_SIZE {
                    return Err(ConsensusError::ExtraDataExceedsMax {
                        len: header.extra_data.len(),
                    })
                }
                Ok(())
            }
            Self::ProofOfAuthority { period } => validate_poa_header(parent, header, *period),
            Self::Fake { .. } => Ok(()),
        }
    }

    fn validate_seal(&self, header: &SealedHeader) -> Result<(), ConsensusError> {
        match self {
            Self::ProofOfWork => validate_pow_seal(header),
            Self::ProofOfAuthority { .. } => validate_poa_seal(header),
            Self::Fake { fail_at } => match fail_at {
                Some(number) if header.number >= *number => {
                    Err(ConsensusError::InvalidSeal { hash: header.hash() })
                }
                _ => Ok(()),
            },
        }
    }
}
