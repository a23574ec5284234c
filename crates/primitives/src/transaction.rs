//! Transaction variants and their circuit bindings.

use noct_consensus::constants::MAX_PROOF_SIZE;
use noct_consensus::Hash256;
use noct_zk::{PublicOutput, PublicParams, ValidationProgram};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

const TAG_STANDARD: u8 = 1;
const TAG_COINBASE: u8 = 2;
const TAG_TREASURY: u8 = 3;
const TAG_MINT: u8 = 4;
const TAG_STAKE: u8 = 5;

/// A shielded output: the note commitment plus the ciphertext encrypted to
/// the recipient.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Output {
    pub commitment: Hash256,
    pub ciphertext: Vec<u8>,
}

impl Output {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.commitment);
        encoder.write_var_bytes(&self.ciphertext);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            commitment: decoder.read_hash()?,
            ciphertext: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StandardTransaction {
    pub outputs: Vec<Output>,
    pub nullifiers: Vec<Hash256>,
    pub txo_root: Hash256,
    pub fee: u64,
    pub locktime: i64,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoinbaseTransaction {
    /// Ed25519 public key of the block producer claiming the subsidy.
    pub validator_id: Vec<u8>,
    pub new_coins: u64,
    pub outputs: Vec<Output>,
    pub signature: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreasuryTransaction {
    pub amount: u64,
    pub outputs: Vec<Output>,
    /// Hash of the governance proposal authorizing the withdrawal.
    pub proposal_hash: Hash256,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MintTransaction {
    pub asset_id: Hash256,
    pub new_tokens: u64,
    pub outputs: Vec<Output>,
    pub nullifiers: Vec<Hash256>,
    pub txo_root: Hash256,
    pub fee: u64,
    /// Ed25519 public key controlling the asset.
    pub mint_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StakeTransaction {
    /// Ed25519 public key of the staking validator.
    pub validator_id: Vec<u8>,
    pub amount: u64,
    pub nullifier: Hash256,
    pub txo_root: Hash256,
    pub signature: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Transaction {
    Standard(StandardTransaction),
    Coinbase(CoinbaseTransaction),
    Treasury(TreasuryTransaction),
    Mint(MintTransaction),
    Stake(StakeTransaction),
}

impl Transaction {
    /// Transaction id: hash of the serialization with proof and signature
    /// cleared, so the id commits to the transfer and not to malleable
    /// witness data.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_with_mode(false))
    }

    /// The message covered by the transaction signature. Identical to the
    /// txid by construction.
    pub fn sig_hash(&self) -> Hash256 {
        self.txid()
    }

    pub fn proof(&self) -> &[u8] {
        match self {
            Transaction::Standard(tx) => &tx.proof,
            Transaction::Coinbase(tx) => &tx.proof,
            Transaction::Treasury(tx) => &tx.proof,
            Transaction::Mint(tx) => &tx.proof,
            Transaction::Stake(tx) => &tx.proof,
        }
    }

    /// Public key and signature for variants that carry one.
    pub fn signature_info(&self) -> Option<(&[u8], &[u8])> {
        match self {
            Transaction::Coinbase(tx) => Some((&tx.validator_id, &tx.signature)),
            Transaction::Mint(tx) => Some((&tx.mint_key, &tx.signature)),
            Transaction::Stake(tx) => Some((&tx.validator_id, &tx.signature)),
            Transaction::Standard(_) | Transaction::Treasury(_) => None,
        }
    }

    /// The circuit program this transaction's proof must satisfy. Pure
    /// function of the variant tag.
    pub fn validation_program(&self) -> ValidationProgram {
        match self {
            Transaction::Standard(_) => ValidationProgram::Standard,
            Transaction::Coinbase(_) => ValidationProgram::Coinbase,
            Transaction::Treasury(_) => ValidationProgram::Treasury,
            Transaction::Mint(_) => ValidationProgram::Mint,
            Transaction::Stake(_) => ValidationProgram::Stake,
        }
    }

    /// Assemble the public circuit parameters for proof verification.
    pub fn public_params(&self) -> PublicParams {
        let mut params = PublicParams::new(self.sig_hash());
        match self {
            Transaction::Standard(tx) => {
                params.nullifiers = tx.nullifiers.clone();
                params.txo_root = tx.txo_root;
                params.fee = tx.fee;
                params.locktime = tx.locktime;
                params.outputs = public_outputs(&tx.outputs);
            }
            Transaction::Coinbase(tx) => {
                params.coinbase = tx.new_coins;
                params.outputs = public_outputs(&tx.outputs);
            }
            Transaction::Treasury(tx) => {
                params.treasury_amount = tx.amount;
                params.outputs = public_outputs(&tx.outputs);
            }
            Transaction::Mint(tx) => {
                params.nullifiers = tx.nullifiers.clone();
                params.txo_root = tx.txo_root;
                params.fee = tx.fee;
                params.mint_id = Some(tx.asset_id);
                params.mint_amount = tx.new_tokens;
                params.outputs = public_outputs(&tx.outputs);
            }
            Transaction::Stake(tx) => {
                params.nullifiers = vec![tx.nullifier];
                params.txo_root = tx.txo_root;
                params.stake_amount = tx.amount;
            }
        }
        params
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        self.encode_with_mode(true)
    }

    fn encode_with_mode(&self, include_witness: bool) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, include_witness);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder, include_witness: bool) {
        match self {
            Transaction::Standard(tx) => {
                encoder.write_u8(TAG_STANDARD);
                write_outputs(encoder, &tx.outputs);
                write_hashes(encoder, &tx.nullifiers);
                encoder.write_hash(&tx.txo_root);
                encoder.write_u64_le(tx.fee);
                encoder.write_i64_le(tx.locktime);
                write_witness(encoder, &tx.proof, include_witness);
            }
            Transaction::Coinbase(tx) => {
                encoder.write_u8(TAG_COINBASE);
                encoder.write_var_bytes(&tx.validator_id);
                encoder.write_u64_le(tx.new_coins);
                write_outputs(encoder, &tx.outputs);
                write_witness(encoder, &tx.signature, include_witness);
                write_witness(encoder, &tx.proof, include_witness);
            }
            Transaction::Treasury(tx) => {
                encoder.write_u8(TAG_TREASURY);
                encoder.write_u64_le(tx.amount);
                write_outputs(encoder, &tx.outputs);
                encoder.write_hash(&tx.proposal_hash);
                write_witness(encoder, &tx.proof, include_witness);
            }
            Transaction::Mint(tx) => {
                encoder.write_u8(TAG_MINT);
                encoder.write_hash(&tx.asset_id);
                encoder.write_u64_le(tx.new_tokens);
                write_outputs(encoder, &tx.outputs);
                write_hashes(encoder, &tx.nullifiers);
                encoder.write_hash(&tx.txo_root);
                encoder.write_u64_le(tx.fee);
                encoder.write_var_bytes(&tx.mint_key);
                write_witness(encoder, &tx.signature, include_witness);
                write_witness(encoder, &tx.proof, include_witness);
            }
            Transaction::Stake(tx) => {
                encoder.write_u8(TAG_STAKE);
                encoder.write_var_bytes(&tx.validator_id);
                encoder.write_u64_le(tx.amount);
                encoder.write_hash(&tx.nullifier);
                encoder.write_hash(&tx.txo_root);
                write_witness(encoder, &tx.signature, include_witness);
                write_witness(encoder, &tx.proof, include_witness);
            }
        }
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tag = decoder.read_u8()?;
        match tag {
            TAG_STANDARD => Ok(Transaction::Standard(StandardTransaction {
                outputs: read_outputs(decoder)?,
                nullifiers: read_hashes(decoder)?,
                txo_root: decoder.read_hash()?,
                fee: decoder.read_u64_le()?,
                locktime: decoder.read_i64_le()?,
                proof: read_proof(decoder)?,
            })),
            TAG_COINBASE => Ok(Transaction::Coinbase(CoinbaseTransaction {
                validator_id: decoder.read_var_bytes()?,
                new_coins: decoder.read_u64_le()?,
                outputs: read_outputs(decoder)?,
                signature: decoder.read_var_bytes()?,
                proof: read_proof(decoder)?,
            })),
            TAG_TREASURY => Ok(Transaction::Treasury(TreasuryTransaction {
                amount: decoder.read_u64_le()?,
                outputs: read_outputs(decoder)?,
                proposal_hash: decoder.read_hash()?,
                proof: read_proof(decoder)?,
            })),
            TAG_MINT => Ok(Transaction::Mint(MintTransaction {
                asset_id: decoder.read_hash()?,
                new_tokens: decoder.read_u64_le()?,
                outputs: read_outputs(decoder)?,
                nullifiers: read_hashes(decoder)?,
                txo_root: decoder.read_hash()?,
                fee: decoder.read_u64_le()?,
                mint_key: decoder.read_var_bytes()?,
                signature: decoder.read_var_bytes()?,
                proof: read_proof(decoder)?,
            })),
            TAG_STAKE => Ok(Transaction::Stake(StakeTransaction {
                validator_id: decoder.read_var_bytes()?,
                amount: decoder.read_u64_le()?,
                nullifier: decoder.read_hash()?,
                txo_root: decoder.read_hash()?,
                signature: decoder.read_var_bytes()?,
                proof: read_proof(decoder)?,
            })),
            _ => Err(DecodeError::InvalidData("unknown transaction tag")),
        }
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }
}

fn public_outputs(outputs: &[Output]) -> Vec<PublicOutput> {
    outputs
        .iter()
        .map(|output| PublicOutput {
            commitment: output.commitment,
            ciphertext: output.ciphertext.clone(),
        })
        .collect()
}

fn write_outputs(encoder: &mut Encoder, outputs: &[Output]) {
    encoder.write_varint(outputs.len() as u64);
    for output in outputs {
        output.encode(encoder);
    }
}

fn read_outputs(decoder: &mut Decoder) -> Result<Vec<Output>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut outputs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        outputs.push(Output::decode(decoder)?);
    }
    Ok(outputs)
}

fn write_hashes(encoder: &mut Encoder, hashes: &[Hash256]) {
    encoder.write_varint(hashes.len() as u64);
    for hash in hashes {
        encoder.write_hash(hash);
    }
}

fn read_hashes(decoder: &mut Decoder) -> Result<Vec<Hash256>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut hashes = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        hashes.push(decoder.read_hash()?);
    }
    Ok(hashes)
}

fn write_witness(encoder: &mut Encoder, bytes: &[u8], include: bool) {
    if include {
        encoder.write_var_bytes(bytes);
    } else {
        encoder.write_varint(0);
    }
}

fn read_proof(decoder: &mut Decoder) -> Result<Vec<u8>, DecodeError> {
    let proof = decoder.read_var_bytes()?;
    if proof.len() > MAX_PROOF_SIZE as usize {
        return Err(DecodeError::SizeTooLarge);
    }
    Ok(proof)
}
