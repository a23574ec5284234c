//! Datastore key layout for the locally accepted chain.

use noct_consensus::Hash256;
use noct_primitives::block::{Block, BlockHeader, BlockTxs};
use noct_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::BlockchainError;

const BLOCK_INDEX_STATE_KEY: &[u8] = b"blockindexstate";

pub fn put_header(batch: &mut WriteBatch, header: &BlockHeader) {
    let id = header.id();
    batch.put(Column::BlockHeader, id, header.consensus_encode());
    batch.put(Column::HeightIndex, header.height.to_be_bytes(), id);
}

pub fn put_block(batch: &mut WriteBatch, block: &Block) {
    put_header(batch, &block.header);
    let txs = BlockTxs {
        transactions: block.transactions.clone(),
    };
    batch.put(Column::BlockTxs, block.id(), txs.consensus_encode());
}

pub fn fetch_header<S: KeyValueStore>(
    store: &S,
    block_id: &Hash256,
) -> Result<Option<BlockHeader>, BlockchainError> {
    let Some(bytes) = store.get(Column::BlockHeader, block_id)? else {
        return Ok(None);
    };
    Ok(Some(BlockHeader::consensus_decode(&bytes)?))
}

pub fn fetch_block_id_from_height<S: KeyValueStore>(
    store: &S,
    height: u32,
) -> Result<Option<Hash256>, BlockchainError> {
    let Some(bytes) = store.get(Column::HeightIndex, &height.to_be_bytes())? else {
        return Ok(None);
    };
    let id: Hash256 = bytes
        .as_slice()
        .try_into()
        .map_err(|_| BlockchainError::InvalidBlock("corrupt height index entry".to_string()))?;
    Ok(Some(id))
}

pub fn fetch_block<S: KeyValueStore>(
    store: &S,
    block_id: &Hash256,
) -> Result<Option<Block>, BlockchainError> {
    let Some(header) = fetch_header(store, block_id)? else {
        return Ok(None);
    };
    let Some(bytes) = store.get(Column::BlockTxs, block_id)? else {
        return Ok(None);
    };
    let txs = BlockTxs::consensus_decode(&bytes)?;
    Ok(Some(Block {
        header,
        transactions: txs.transactions,
    }))
}

/// Persisted block index tip: block id followed by the big-endian height.
pub fn put_block_index_state(batch: &mut WriteBatch, tip_id: &Hash256, height: u32) {
    let mut value = Vec::with_capacity(36);
    value.extend_from_slice(tip_id);
    value.extend_from_slice(&height.to_be_bytes());
    batch.put(Column::Meta, BLOCK_INDEX_STATE_KEY, value);
}

pub fn fetch_block_index_state<S: KeyValueStore>(
    store: &S,
) -> Result<Option<(Hash256, u32)>, BlockchainError> {
    let Some(bytes) = store.get(Column::Meta, BLOCK_INDEX_STATE_KEY)? else {
        return Ok(None);
    };
    if bytes.len() != 36 {
        return Err(BlockchainError::InvalidBlock(
            "corrupt block index state".to_string(),
        ));
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&bytes[0..32]);
    let height = u32::from_be_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
    Ok(Some((id, height)))
}
