//! Peer-to-peer network capability consumed by the sync manager.

use std::net::SocketAddr;

/// The transport layer's view of the peer set. Implementations own
/// connection management and the ban list; the sync manager only reports
/// misbehavior and reacts to disconnects.
pub trait Network: Send + Sync {
    /// Currently connected peers that speak the chain service protocol.
    fn sync_peers(&self) -> Vec<SocketAddr>;

    /// Raise a peer's ban score. `hard` points are for protocol violations
    /// and cross the disconnect threshold immediately; `soft` points are
    /// availability penalties that deprioritize the peer.
    fn increase_banscore(&self, peer: SocketAddr, hard: u32, soft: u32);

    /// Register a hook invoked whenever a peer disconnects. Hooks must not
    /// block.
    fn on_peer_disconnect(&self, hook: Box<dyn Fn(SocketAddr) + Send + Sync>);
}
