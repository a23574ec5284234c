//! Zero-knowledge verifier capability consumed by block validation.
//!
//! The actual proving system lives outside this workspace. Validation code
//! only needs to name the circuit program for a transaction kind, assemble
//! the public parameters, and hand both to a [`Verifier`].

pub mod circparams;

pub use circparams::{PublicOutput, PublicParams};

use std::fmt;

/// The circuit program a proof must satisfy. One program per transaction
/// kind; the mapping is a pure function of the variant tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ValidationProgram {
    Standard,
    Coinbase,
    Treasury,
    Mint,
    Stake,
}

impl ValidationProgram {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard_validation",
            Self::Coinbase => "coinbase_validation",
            Self::Treasury => "treasury_validation",
            Self::Mint => "mint_validation",
            Self::Stake => "stake_validation",
        }
    }
}

#[derive(Debug)]
pub enum VerifierError {
    /// The proof bytes could not be parsed by the proving system.
    MalformedProof,
    /// The public parameters are not valid for the requested program.
    InvalidParams(String),
    /// The backend failed for reasons unrelated to proof validity.
    Backend(String),
}

impl fmt::Display for VerifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifierError::MalformedProof => write!(f, "malformed proof"),
            VerifierError::InvalidParams(message) => {
                write!(f, "invalid public parameters: {message}")
            }
            VerifierError::Backend(message) => write!(f, "verifier backend: {message}"),
        }
    }
}

impl std::error::Error for VerifierError {}

/// Proof verification capability. Implementations must be deterministic and
/// safe to call from multiple threads at once.
pub trait Verifier: Send + Sync {
    fn verify(
        &self,
        program: ValidationProgram,
        params: &PublicParams,
        proof: &[u8],
    ) -> Result<bool, VerifierError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_names_are_distinct() {
        let programs = [
            ValidationProgram::Standard,
            ValidationProgram::Coinbase,
            ValidationProgram::Treasury,
            ValidationProgram::Mint,
            ValidationProgram::Stake,
        ];
        for (i, a) in programs.iter().enumerate() {
            for b in &programs[i + 1..] {
                assert_ne!(a.as_str(), b.as_str());
            }
        }
    }
}
