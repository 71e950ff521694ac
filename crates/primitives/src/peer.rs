use alloy_primitives::B512;

/// Alias for a peer identifier: the 512 bit public node key.
pub type PeerId = B512;
