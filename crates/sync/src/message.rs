//! Wire messages for the chain service protocol.
//!
//! Unary requests get exactly one response frame. Stream requests are
//! answered with consecutive header / block-txs frames until the server
//! closes the stream.

use noct_consensus::Hash256;
use noct_primitives::block::{Block, BlockHeader, BlockTxs};
use noct_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::error::ChainServiceError;

const REQ_GET_BEST: u8 = 1;
const REQ_GET_BLOCK_ID: u8 = 2;
const REQ_GET_BLOCK: u8 = 3;
const REQ_GET_BLOCK_TXIDS: u8 = 4;
const REQ_GET_BLOCK_TXS: u8 = 5;
const REQ_GET_HEADERS_STREAM: u8 = 6;
const REQ_GET_BLOCK_TXS_STREAM: u8 = 7;

const RESP_BEST: u8 = 1;
const RESP_BLOCK_ID: u8 = 2;
const RESP_BLOCK: u8 = 3;
const RESP_BLOCK_TXIDS: u8 = 4;
const RESP_BLOCK_TXS: u8 = 5;
const RESP_ERROR: u8 = 6;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainServiceRequest {
    GetBest,
    GetBlockId { height: u32 },
    GetBlock { block_id: Hash256 },
    GetBlockTxids { block_id: Hash256 },
    GetBlockTxs { block_id: Hash256 },
    GetHeadersStream { from_height: u32 },
    GetBlockTxsStream { from_height: u32 },
}

impl ChainServiceRequest {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            ChainServiceRequest::GetBest => encoder.write_u8(REQ_GET_BEST),
            ChainServiceRequest::GetBlockId { height } => {
                encoder.write_u8(REQ_GET_BLOCK_ID);
                encoder.write_u32_le(*height);
            }
            ChainServiceRequest::GetBlock { block_id } => {
                encoder.write_u8(REQ_GET_BLOCK);
                encoder.write_hash(block_id);
            }
            ChainServiceRequest::GetBlockTxids { block_id } => {
                encoder.write_u8(REQ_GET_BLOCK_TXIDS);
                encoder.write_hash(block_id);
            }
            ChainServiceRequest::GetBlockTxs { block_id } => {
                encoder.write_u8(REQ_GET_BLOCK_TXS);
                encoder.write_hash(block_id);
            }
            ChainServiceRequest::GetHeadersStream { from_height } => {
                encoder.write_u8(REQ_GET_HEADERS_STREAM);
                encoder.write_u32_le(*from_height);
            }
            ChainServiceRequest::GetBlockTxsStream { from_height } => {
                encoder.write_u8(REQ_GET_BLOCK_TXS_STREAM);
                encoder.write_u32_le(*from_height);
            }
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let request = match decoder.read_u8()? {
            REQ_GET_BEST => ChainServiceRequest::GetBest,
            REQ_GET_BLOCK_ID => ChainServiceRequest::GetBlockId {
                height: decoder.read_u32_le()?,
            },
            REQ_GET_BLOCK => ChainServiceRequest::GetBlock {
                block_id: decoder.read_hash()?,
            },
            REQ_GET_BLOCK_TXIDS => ChainServiceRequest::GetBlockTxids {
                block_id: decoder.read_hash()?,
            },
            REQ_GET_BLOCK_TXS => ChainServiceRequest::GetBlockTxs {
                block_id: decoder.read_hash()?,
            },
            REQ_GET_HEADERS_STREAM => ChainServiceRequest::GetHeadersStream {
                from_height: decoder.read_u32_le()?,
            },
            REQ_GET_BLOCK_TXS_STREAM => ChainServiceRequest::GetBlockTxsStream {
                from_height: decoder.read_u32_le()?,
            },
            _ => return Err(DecodeError::InvalidData("unknown request tag")),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(request)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorResponse {
    None = 0,
    NotFound = 1,
    BadRequest = 2,
    NotCurrent = 3,
}

impl ErrorResponse {
    fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(ErrorResponse::None),
            1 => Ok(ErrorResponse::NotFound),
            2 => Ok(ErrorResponse::BadRequest),
            3 => Ok(ErrorResponse::NotCurrent),
            _ => Err(DecodeError::InvalidData("unknown error response tag")),
        }
    }

    /// Map the wire error onto the client error, or `None` for
    /// [`ErrorResponse::None`].
    pub fn into_service_error(self) -> Option<ChainServiceError> {
        match self {
            ErrorResponse::None => None,
            ErrorResponse::NotFound => Some(ChainServiceError::NotFound),
            ErrorResponse::BadRequest => Some(ChainServiceError::BadRequest),
            ErrorResponse::NotCurrent => Some(ChainServiceError::NotCurrent),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainServiceResponse {
    Best { block_id: Hash256, height: u32 },
    BlockId { block_id: Hash256 },
    Block { block: Block },
    BlockTxids { txids: Vec<Hash256> },
    BlockTxs { txs: BlockTxs },
    Error { error: ErrorResponse },
}

impl ChainServiceResponse {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            ChainServiceResponse::Best { block_id, height } => {
                encoder.write_u8(RESP_BEST);
                encoder.write_hash(block_id);
                encoder.write_u32_le(*height);
            }
            ChainServiceResponse::BlockId { block_id } => {
                encoder.write_u8(RESP_BLOCK_ID);
                encoder.write_hash(block_id);
            }
            ChainServiceResponse::Block { block } => {
                encoder.write_u8(RESP_BLOCK);
                encoder.write_var_bytes(&block.consensus_encode());
            }
            ChainServiceResponse::BlockTxids { txids } => {
                encoder.write_u8(RESP_BLOCK_TXIDS);
                encoder.write_varint(txids.len() as u64);
                for txid in txids {
                    encoder.write_hash(txid);
                }
            }
            ChainServiceResponse::BlockTxs { txs } => {
                encoder.write_u8(RESP_BLOCK_TXS);
                encoder.write_var_bytes(&txs.consensus_encode());
            }
            ChainServiceResponse::Error { error } => {
                encoder.write_u8(RESP_ERROR);
                encoder.write_u8(*error as u8);
            }
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let response = match decoder.read_u8()? {
            RESP_BEST => ChainServiceResponse::Best {
                block_id: decoder.read_hash()?,
                height: decoder.read_u32_le()?,
            },
            RESP_BLOCK_ID => ChainServiceResponse::BlockId {
                block_id: decoder.read_hash()?,
            },
            RESP_BLOCK => {
                let bytes = decoder.read_var_bytes()?;
                ChainServiceResponse::Block {
                    block: Block::consensus_decode(&bytes)?,
                }
            }
            RESP_BLOCK_TXIDS => {
                let count = decoder.read_varint()?;
                let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
                let mut txids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    txids.push(decoder.read_hash()?);
                }
                ChainServiceResponse::BlockTxids { txids }
            }
            RESP_BLOCK_TXS => {
                let bytes = decoder.read_var_bytes()?;
                ChainServiceResponse::BlockTxs {
                    txs: BlockTxs::consensus_decode(&bytes)?,
                }
            }
            RESP_ERROR => ChainServiceResponse::Error {
                error: ErrorResponse::from_tag(decoder.read_u8()?)?,
            },
            _ => return Err(DecodeError::InvalidData("unknown response tag")),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(response)
    }
}

/// One frame of a headers stream.
pub fn encode_header_frame(header: &BlockHeader) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_bytes(&header.consensus_encode());
    encoder.into_inner()
}

pub fn decode_header_frame(bytes: &[u8]) -> Result<BlockHeader, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let inner = decoder.read_var_bytes()?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    BlockHeader::consensus_decode(&inner)
}
