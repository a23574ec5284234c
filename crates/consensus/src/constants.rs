//! Consensus-wide constants shared across validation and the wire protocol.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 2_000_000;
/// The maximum allowed number of transactions in a block (network rule).
pub const MAX_BLOCK_TXS: u32 = 50_000;
/// The maximum allowed size for a single serialized transaction proof, in bytes.
pub const MAX_PROOF_SIZE: u32 = 1_000_000;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol id segment for the chain service (block/header serving).
pub const CHAIN_SERVICE_PROTOCOL: &str = "/chainservice/";
/// Version segment appended to the chain service protocol id.
pub const CHAIN_SERVICE_PROTOCOL_VERSION: &str = "1.0.0";
