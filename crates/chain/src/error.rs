use std::fmt;

use noct_primitives::encoding::DecodeError;
use noct_storage::StoreError;
use noct_zk::VerifierError;

#[derive(Debug)]
pub enum BlockchainError {
    Store(StoreError),
    Decode(DecodeError),
    Verifier(VerifierError),
    /// A transaction failed a consensus rule (bad proof, bad signature).
    InvalidTx(&'static str),
    /// A block failed a consensus rule.
    InvalidBlock(String),
    /// A record expected to be in the datastore was not.
    NotFound(&'static str),
    /// The operation was abandoned because the owner is shutting down.
    Cancelled,
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Store(err) => write!(f, "datastore: {err}"),
            BlockchainError::Decode(err) => write!(f, "decode: {err}"),
            BlockchainError::Verifier(err) => write!(f, "verifier: {err}"),
            BlockchainError::InvalidTx(message) => write!(f, "invalid transaction: {message}"),
            BlockchainError::InvalidBlock(message) => write!(f, "invalid block: {message}"),
            BlockchainError::NotFound(what) => write!(f, "not found: {what}"),
            BlockchainError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<StoreError> for BlockchainError {
    fn from(err: StoreError) -> Self {
        BlockchainError::Store(err)
    }
}

impl From<DecodeError> for BlockchainError {
    fn from(err: DecodeError) -> Self {
        BlockchainError::Decode(err)
    }
}

impl From<VerifierError> for BlockchainError {
    fn from(err: VerifierError) -> Self {
        BlockchainError::Verifier(err)
    }
}
