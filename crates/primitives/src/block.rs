//! Block header, block, and block-transaction-set types.

use noct_consensus::constants::MAX_BLOCK_TXS;
use noct_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const CURRENT_VERSION: u32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u32,
    pub parent: Hash256,
    /// Merkle root over the txids of the block's transactions.
    pub tx_root: Hash256,
    pub timestamp: i64,
    /// Ed25519 public key of the block producer.
    pub producer: Vec<u8>,
    pub signature: Vec<u8>,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        self.encode_with_mode(true)
    }

    pub fn consensus_encode_for_id(&self) -> Vec<u8> {
        self.encode_with_mode(false)
    }

    /// Block id: hash of the header with the producer signature excluded.
    pub fn id(&self) -> Hash256 {
        sha256d(&self.consensus_encode_for_id())
    }

    fn encode_with_mode(&self, include_signature: bool) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, include_signature);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder, include_signature: bool) {
        encoder.write_u32_le(self.version);
        encoder.write_u32_le(self.height);
        encoder.write_hash(&self.parent);
        encoder.write_hash(&self.tx_root);
        encoder.write_i64_le(self.timestamp);
        encoder.write_var_bytes(&self.producer);
        if include_signature {
            encoder.write_var_bytes(&self.signature);
        } else {
            encoder.write_varint(0);
        }
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_u32_le()?,
            height: decoder.read_u32_le()?,
            parent: decoder.read_hash()?,
            tx_root: decoder.read_hash()?,
            timestamp: decoder.read_i64_le()?,
            producer: decoder.read_var_bytes()?,
            signature: decoder.read_var_bytes()?,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn id(&self) -> Hash256 {
        self.header.id()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.encode_into(&mut encoder, true);
        write_transactions(&mut encoder, &self.transactions);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let transactions = read_transactions(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// The transactions of one block as served by the chain service block-txs
/// stream. The header travels on the headers stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockTxs {
    pub transactions: Vec<Transaction>,
}

impl BlockTxs {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        write_transactions(&mut encoder, &self.transactions);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let transactions = read_transactions(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { transactions })
    }
}

fn write_transactions(encoder: &mut Encoder, transactions: &[Transaction]) {
    encoder.write_varint(transactions.len() as u64);
    for tx in transactions {
        tx.encode_into(encoder, true);
    }
}

fn read_transactions(decoder: &mut Decoder) -> Result<Vec<Transaction>, DecodeError> {
    let count = decoder.read_varint()?;
    if count > MAX_BLOCK_TXS as u64 {
        return Err(DecodeError::SizeTooLarge);
    }
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    let mut transactions = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        transactions.push(Transaction::decode_from(decoder)?);
    }
    Ok(transactions)
}
