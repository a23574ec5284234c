//! Chain-side support for trustless sync: the block index cache, the proof
//! and signature caches, the batched transaction validators, and the chain
//! capability trait the sync manager drives.

pub mod cache;
pub mod ds;
pub mod error;
pub mod index;
pub mod validator;

pub use cache::{ProofCache, SigCache};
pub use error::BlockchainError;
pub use index::{BlockIndex, BlockNode, BLOCK_INDEX_CACHE_SIZE};
pub use validator::{CancelToken, ProofValidator, SigValidator};

use noct_consensus::Hash256;
use noct_primitives::block::Block;

/// A comparable score for a window of blocks. Lower is better.
pub type ChainScore = u64;

/// How much validation to run when a block is processed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BehaviorFlags {
    /// The block is covered by a checkpoint; skip proof and signature
    /// validation entirely.
    pub fast_add: bool,
    /// Skip all contextual validation. Testing only.
    pub no_validation: bool,
}

impl BehaviorFlags {
    pub const NONE: BehaviorFlags = BehaviorFlags {
        fast_add: false,
        no_validation: false,
    };
    pub const FAST_ADD: BehaviorFlags = BehaviorFlags {
        fast_add: true,
        no_validation: false,
    };

    /// Whether proof and signature validation is skipped under these flags.
    pub fn skips_witness_validation(&self) -> bool {
        self.fast_add || self.no_validation
    }
}

/// The locally accepted chain. The sync manager only ever extends it through
/// this interface; consensus rules live behind it.
pub trait Chain: Send + Sync {
    fn best_block(&self) -> (Hash256, u32);

    /// Score a contiguous window of blocks for fork comparison. Lower is
    /// better. Fails if the window is not internally valid.
    fn calc_chain_score(
        &self,
        blocks: &[Block],
        flags: BehaviorFlags,
    ) -> Result<ChainScore, BlockchainError>;

    /// Validate and connect the next block. Blocks must arrive in strictly
    /// ascending height order.
    fn connect_block(&self, block: &Block, flags: BehaviorFlags) -> Result<(), BlockchainError>;
}
