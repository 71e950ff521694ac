//! All functions for verification of headers
use fbc_interfaces::consensus::ConsensusError;
use fbc_primitives::{keccak256, Bytes, SealedHeader, B256, U256};

/// Maximum extra data size of a proof-of-work header.
pub const MAXIMUM_EXTRA_DATA_SIZE: usize = 32;

/// Fixed number of extra-data prefix bytes reserved for signer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Fixed number of extra-data suffix bytes reserved for the signer seal.
pub const EXTRA_SEAL: usize = 65;

/// Validate header standalone
pub fn validate_header_standalone(header: &SealedHeader) -> Result<(), ConsensusError> {
    // Gas used needs to be less then gas limit. Gas used is going to be check after execution.
    if header.gas_used > header.gas_limit {
        return Err(ConsensusError::HeaderGasUsedExceedsGasLimit {
            gas_used: header.gas_used,
            gas_limit: header.gas_limit,
        })
    }
    Ok(())
}

/// Validate header in regards to its parent.
pub fn validate_header_regarding_parent(
    parent: &SealedHeader,
    child: &SealedHeader,
) -> Result<(), ConsensusError> {
    if child.parent_hash != parent.hash() {
        return Err(ConsensusError::ParentHashMismatch {
            expected_parent_hash: parent.hash(),
            got_parent_hash: child.parent_hash,
        })
    }

    // Parent number is consistent.
    if parent.number + 1 != child.number {
        return Err(ConsensusError::ParentBlockNumberMismatch {
            parent_block_number: parent.number,
            block_number: child.number,
        })
    }

    // timestamp in past check
    if child.timestamp < parent.timestamp {
        return Err(ConsensusError::TimestampIsInPast {
            parent_timestamp: parent.timestamp,
            timestamp: child.timestamp,
        })
    }

    // Check gas limit, max diff between child/parent gas_limit should be max_diff=parent_gas/1024
    let parent_gas_limit = parent.gas_limit;
    let max_diff = parent_gas_limit / 1024;
    if child.gas_limit.abs_diff(parent_gas_limit) > max_diff {
        return Err(ConsensusError::GasLimitInvalidChange {
            parent_gas_limit,
            child_gas_limit: child.gas_limit,
        })
    }

    Ok(())
}

/// Hash of the header without the proof-of-work fields, which is what the nonce is mined over.
pub fn seal_hash(header: &SealedHeader) -> B256 {
    let mut unsealed = header.header().clone();
    unsealed.nonce = 0;
    unsealed.mix_hash = B256::ZERO;
    unsealed.hash_slow()
}

/// The proof-of-work digest of a header: `keccak256(seal_hash ++ nonce)`.
pub fn pow_digest(seal_hash: B256, nonce: u64) -> B256 {
    let mut buf = [0u8; 40];
    buf[..32].copy_from_slice(seal_hash.as_slice());
    buf[32..].copy_from_slice(&nonce.to_be_bytes());
    keccak256(buf)
}

/// Verifies the proof-of-work seal: the mix digest commits to the nonce and the digest is below
/// `2^256 / difficulty`.
pub fn validate_pow_seal(header: &SealedHeader) -> Result<(), ConsensusError> {
    if header.difficulty.is_zero() {
        return Err(ConsensusError::InvalidDifficulty { difficulty: header.difficulty })
    }
    let digest = pow_digest(seal_hash(header), header.nonce);
    if digest != header.mix_hash {
        return Err(ConsensusError::InvalidSeal { hash: header.hash() })
    }
    let target = U256::MAX / header.difficulty;
    if U256::from_be_bytes(digest.0) > target {
        return Err(ConsensusError::InvalidSeal { hash: header.hash() })
    }
    Ok(())
}

/// Structural checks of a proof-of-authority header: the extra data must carry vanity and seal,
/// the difficulty is 1 (out of turn) or 2 (in turn) and blocks respect the period.
pub fn validate_poa_header(
    parent: &SealedHeader,
    header: &SealedHeader,
    period: u64,
) -> Result<(), ConsensusError> {
    if header.extra_data.len() < EXTRA_VANITY + EXTRA_SEAL {
        return Err(ConsensusError::MissingSignerSeal { len: header.extra_data.len() })
    }
    if header.difficulty != U256::from(1) && header.difficulty != U256::from(2) {
        return Err(ConsensusError::InvalidDifficulty { difficulty: header.difficulty })
    }
    if header.timestamp < parent.timestamp + period {
        return Err(ConsensusError::TimestampIsInPast {
            parent_timestamp: parent.timestamp,
            timestamp: header.timestamp,
        })
    }
    Ok(())
}

/// Verifies the authority seal.
///
/// The seal is the trailing [`EXTRA_SEAL`] bytes of the extra data. Its first 32 bytes must be
/// `keccak256` of the hash of the header without the seal.
pub fn validate_poa_seal(header: &SealedHeader) -> Result<(), ConsensusError> {
    let len = header.extra_data.len();
    if len < EXTRA_VANITY + EXTRA_SEAL {
        return Err(ConsensusError::MissingSignerSeal { len })
    }
    let seal = &header.extra_data[len - EXTRA_SEAL..];
    let mut unsealed = header.header().clone();
    unsealed.extra_data = Bytes::copy_from_slice(&header.extra_data[..len - EXTRA_SEAL]);
    let expected = keccak256(unsealed.hash_slow());
    if seal[..32] != expected[..] {
        return Err(ConsensusError::InvalidSeal { hash: header.hash() })
    }
    Ok(())
}
