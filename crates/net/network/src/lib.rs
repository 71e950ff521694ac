#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Networking side of the fbc sync engine.
//!
//! The transport itself (sessions, wire encoding) lives behind the [`PeerTransport`] trait. This
//! crate provides what the sync engine builds on top of it:
//!
//! - [`Correlator`]: matches asynchronous responses to the requests they answer, resolving every
//!   request exactly once.
//! - [`FetchClient`]: typed requests with timeouts and cancellation.
//! - [`PeerRegistry`]: the peers, their advertised chains, load and measured performance.
//! - [`BlockFetcher`]: imports blocks propagated after the node caught up.
//!
//! ## Feature Flags
//!
//! - `test-utils`: Export utilities for testing

mod cache;
mod correlator;
pub mod fetch;
pub mod fetcher;
pub mod message;
mod metrics;
pub mod peers;
mod transport;

pub use cache::LruCache;
pub use correlator::{Correlator, PendingRequest};
pub use fetch::FetchClient;
pub use fetcher::{
    Announcement, BlockFetcher, BlockImporter, FetchAction, FetcherEvent, FetcherHandle,
    FetcherMessage, FetcherTask, PropagationOutcome,
};
pub use message::{
    BlockHashNumber, EthRequest, EthResponse, GetBlockHeaders, NetworkEvent, NewBlock, Status,
};
pub use peers::{Peer, PeerRegistry, PeerState, RegisterError};
pub use transport::PeerTransport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
