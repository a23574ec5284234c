use std::fmt;

use noct_chain::BlockchainError;

/// Errors surfaced by a chain-service RPC against one peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainServiceError {
    /// The peer does not have the requested record.
    NotFound,
    /// The peer is itself still syncing and declined to answer.
    NotCurrent,
    /// The peer rejected the request as malformed.
    BadRequest,
    /// The peer-level deadline elapsed.
    Timeout,
    /// The peer closed a stream before sending any data.
    StreamClosed,
    /// Connection-level failure.
    Transport(String),
}

impl fmt::Display for ChainServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainServiceError::NotFound => write!(f, "not found"),
            ChainServiceError::NotCurrent => write!(f, "peer not current"),
            ChainServiceError::BadRequest => write!(f, "bad request"),
            ChainServiceError::Timeout => write!(f, "request timed out"),
            ChainServiceError::StreamClosed => write!(f, "stream closed without data"),
            ChainServiceError::Transport(message) => write!(f, "transport: {message}"),
        }
    }
}

impl std::error::Error for ChainServiceError {}

#[derive(Debug)]
pub enum SyncError {
    /// No sync-capable peers are connected.
    NoPeers,
    /// Fewer than half of the queried peers answered; retry later.
    QueryQuorum,
    /// A peer RPC failed.
    Service(ChainServiceError),
    /// A peer served data that violates the protocol contract.
    Protocol(String),
    /// A batch failed proof or signature validation.
    Validation(String),
    /// The chain rejected a block.
    Chain(BlockchainError),
    /// The consensus chooser could not pick a tip.
    Chooser(String),
    /// The sync session is shutting down.
    Cancelled,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::NoPeers => write!(f, "no peers to query"),
            SyncError::QueryQuorum => {
                write!(f, "less than half of peers returned height query response")
            }
            SyncError::Service(err) => write!(f, "chain service: {err}"),
            SyncError::Protocol(message) => write!(f, "protocol violation: {message}"),
            SyncError::Validation(message) => write!(f, "{message}"),
            SyncError::Chain(err) => write!(f, "chain: {err}"),
            SyncError::Chooser(message) => write!(f, "consensus chooser: {message}"),
            SyncError::Cancelled => write!(f, "sync cancelled"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ChainServiceError> for SyncError {
    fn from(err: ChainServiceError) -> Self {
        SyncError::Service(err)
    }
}

impl From<BlockchainError> for SyncError {
    fn from(err: BlockchainError) -> Self {
        SyncError::Chain(err)
    }
}
