#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! fbc interface bindings
//!
//! The synchronization engine consumes consensus, block execution and storage as external
//! capabilities. This crate defines those seams as traits, together with the error taxonomy of the
//! p2p layer.

/// Consensus traits.
pub mod consensus;

/// Block Execution traits.
pub mod executor;

/// Possible errors when interacting with the chain.
mod error;
pub use error::{FbcError, FbcResult};

/// P2P traits.
pub mod p2p;

/// Storage traits.
pub mod provider;

/// Syncing related traits.
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
/// Common test helpers for mocking out Consensus, Execution and Storage.
pub mod test_utils;
