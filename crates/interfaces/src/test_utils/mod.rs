mod consensus;
mod executor;
mod store;

/// Generators for different data structures like block headers and whole test chains.
pub mod generators;

pub use consensus::TestConsensus;
pub use executor::{TestExecutor, TestState};
pub use generators::TestChain;
pub use store::{MemoryKv, TestChainStore};
