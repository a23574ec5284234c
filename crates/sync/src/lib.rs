//! Trustless chain synchronization.
//!
//! The sync manager brings the local chain to the best live tip against a
//! set of partially-untrusted peers: it sorts peers into buckets by the tip
//! they follow, queries ahead of the local tip to surface forks early,
//! binary-searches disagreements down to the fork point, scores the
//! competing evaluation windows (or asks the consensus chooser near the
//! tip), and downloads and validates blocks in batches.

pub mod buckets;
pub mod client;
pub mod error;
pub mod manager;
pub mod message;
pub mod network;

pub use buckets::PeerBuckets;
pub use client::ChainClient;
pub use error::{ChainServiceError, SyncError};
pub use manager::{
    ConsensusChooser, SyncManager, SyncManagerConfig, BAN_SCORE_HARD, BAN_SCORE_SOFT,
    BEST_HEIGHT_QUERY_SIZE, EVALUATION_WINDOW, LOOKAHEAD_SIZE, MAX_BATCH_SIZE,
    NEXT_HEIGHT_QUERY_SIZE,
};
pub use network::Network;
