//! Public circuit parameters assembled from transaction data.

use noct_consensus::Hash256;

/// An output commitment as seen by the circuit, together with the ciphertext
/// the sender encrypted to the recipient.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublicOutput {
    pub commitment: Hash256,
    pub ciphertext: Vec<u8>,
}

/// The public inputs to a validation circuit. Unused fields are left at
/// their defaults; which fields a program reads is fixed by the program.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublicParams {
    /// Hash of the transaction with proof and signature cleared.
    pub sig_hash: Hash256,
    pub nullifiers: Vec<Hash256>,
    pub txo_root: Hash256,
    pub fee: u64,
    /// New coins created by a coinbase transaction.
    pub coinbase: u64,
    /// Coins withdrawn from the treasury by a treasury transaction.
    pub treasury_amount: u64,
    /// Coins locked by a stake transaction.
    pub stake_amount: u64,
    /// Asset id for mint transactions.
    pub mint_id: Option<Hash256>,
    pub mint_amount: u64,
    pub outputs: Vec<PublicOutput>,
    pub locktime: i64,
}

impl PublicParams {
    pub fn new(sig_hash: Hash256) -> Self {
        Self {
            sig_hash,
            ..Self::default()
        }
    }
}
