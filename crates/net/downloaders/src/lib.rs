#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
#![allow(clippy::result_large_err)]

//! Implements the work scheduling of a bulk chain download.
//!
//! The [`TaskQueue`] owns every unit of work a sync session needs (header ranges, block bodies,
//! receipts and state trie nodes), hands it out to peers, verifies what comes back and assembles
//! verified blocks into contiguous [`Batch`]es ready for commit.

/// Validation of downloaded headers.
pub mod headers;

/// Download metrics.
pub mod metrics;

mod queue;
pub use queue::{
    Batch, BlockResult, Delivery, Expired, QueueError, TaskQueue, WorkItem, WorkKey, WorkState,
};
