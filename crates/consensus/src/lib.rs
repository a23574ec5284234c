//! Network parameters, checkpoints, and consensus-wide constants.

pub mod constants;
pub mod params;

pub use params::{
    hash256_from_hex, hash256_to_hex, network_params, Checkpoint, Network, NetworkParams,
};

/// A 32-byte content hash. Block IDs, transaction IDs, proof hashes, and
/// merkle roots are all values of this type. Ordering is byte-wise.
pub type Hash256 = [u8; 32];
