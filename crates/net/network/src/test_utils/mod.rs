//! Common helpers for network testing.

mod testnet;

pub use testnet::{PeerBehaviour, PeerConfig, Testnet, TEST_PROTOCOL_VERSION};
