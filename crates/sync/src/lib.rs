#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
#![allow(clippy::result_large_err)]

//! Bulk chain synchronization.
//!
//! The [`Synchronizer`] brings the local chain up to the heaviest chain known among the
//! connected peers. A session:
//!
//! 1. picks the peer advertising the highest total difficulty as master and fetches its head,
//! 2. searches the common ancestor of both chains,
//! 3. fetches a skeleton of the target chain from the master, and has every peer fill the gaps
//!    with headers, bodies and, in fast mode, receipts and the state at a pivot block,
//! 4. commits the downloaded blocks in order, executing them in full mode and after the pivot.
//!
//! Outside of sessions, blocks propagated by peers are imported by the fetcher of
//! [`fbc_network`]. The [`ProtocolHandler`] routes the transport events to both.
//!
//! ## Feature Flags
//!
//! There are none; test utilities come from `fbc-interfaces` and `fbc-network`.

mod ancestor;
mod builder;
mod commit;
mod controller;
mod error;
mod handle;
mod handler;
mod metrics;
mod progress;
mod skeleton;
mod state;

pub use builder::{SyncBuilder, SyncTasks};
pub use commit::ChainImporter;
pub use controller::Synchronizer;
pub use error::SyncError;
pub use handle::{SyncCommand, SyncHandle};
pub use handler::ProtocolHandler;
pub use progress::{SessionState, SyncEvent, SyncProgress, SyncStatus};
