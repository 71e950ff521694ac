//! Standalone crate for fbc configuration types.

#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

pub mod config;
pub use config::{Config, FetcherConfig, ParseSyncModeError, PeersConfig, SyncConfig, SyncMode};
