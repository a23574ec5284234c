//! Per-peer chain-service RPC client capability.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;

use noct_consensus::Hash256;
use noct_primitives::block::{BlockHeader, BlockTxs};

use crate::error::ChainServiceError;

/// Per-peer RPC against the chain service. One logical request per call;
/// streams deliver items over a channel until the peer closes the stream.
/// Implementations apply a peer-level deadline to every request and a
/// per-item deadline inside streams.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The peer's best block id and height.
    async fn get_best(&self, peer: SocketAddr) -> Result<(Hash256, u32), ChainServiceError>;

    /// The block id the peer has at `height`, or `NotFound` if the peer's
    /// chain is shorter.
    async fn get_block_id(
        &self,
        peer: SocketAddr,
        height: u32,
    ) -> Result<Hash256, ChainServiceError>;

    /// Stream of consecutive headers starting at `from_height`. The peer
    /// closes the stream at its tip or at its own batch limit; re-request to
    /// continue.
    async fn get_headers_stream(
        &self,
        peer: SocketAddr,
        from_height: u32,
    ) -> Result<mpsc::Receiver<BlockHeader>, ChainServiceError>;

    /// Stream of per-block transaction sets starting at `from_height`,
    /// aligned with the headers stream.
    async fn get_block_txs_stream(
        &self,
        peer: SocketAddr,
        from_height: u32,
    ) -> Result<mpsc::Receiver<BlockTxs>, ChainServiceError>;
}
