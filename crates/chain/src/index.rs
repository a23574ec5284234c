//! In-memory cache of the locally accepted chain, backed by the datastore.
//!
//! Nodes hold only an id and a height. Parent and child relationships are
//! resolved by height lookup through the cache or the datastore, so evicting
//! a cached node can never leave a dangling reference.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use noct_consensus::Hash256;
use noct_primitives::block::{Block, BlockHeader};
use noct_storage::{KeyValueStore, WriteBatch};

use crate::ds;
use crate::error::BlockchainError;

pub const BLOCK_INDEX_CACHE_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockNode {
    pub block_id: Hash256,
    pub height: u32,
}

struct IndexInner {
    tip: Option<BlockNode>,
    by_id: HashMap<Hash256, BlockNode>,
    by_height: HashMap<u32, BlockNode>,
}

pub struct BlockIndex<S> {
    store: Arc<S>,
    inner: Mutex<IndexInner>,
}

impl<S: KeyValueStore> BlockIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            inner: Mutex::new(IndexInner {
                tip: None,
                by_id: HashMap::new(),
                by_height: HashMap::new(),
            }),
        }
    }

    /// Load the persisted tip and warm the cache with the most recent
    /// stretch of the chain.
    pub fn init(&self) -> Result<(), BlockchainError> {
        let Some((tip_id, tip_height)) = ds::fetch_block_index_state(self.store.as_ref())? else {
            return Ok(());
        };
        let tip = BlockNode {
            block_id: tip_id,
            height: tip_height,
        };

        let mut inner = self.lock();
        inner.tip = Some(tip);
        insert_node(&mut inner, tip);
        drop(inner);

        let mut node = tip;
        for _ in 0..BLOCK_INDEX_CACHE_SIZE {
            match self.parent_of(&node)? {
                Some(parent) => node = parent,
                None => break,
            }
        }
        Ok(())
    }

    pub fn tip(&self) -> Option<BlockNode> {
        self.lock().tip
    }

    /// Persist the current tip. Cache contents are never persisted.
    pub fn commit(&self, batch: &mut WriteBatch) {
        if let Some(tip) = self.lock().tip {
            ds::put_block_index_state(batch, &tip.block_id, tip.height);
        }
    }

    /// Advance the tip with a newly connected header. Does not touch the
    /// datastore; call [`BlockIndex::commit`] for that.
    pub fn extend_index(&self, header: &BlockHeader) {
        let node = BlockNode {
            block_id: header.id(),
            height: header.height,
        };
        let mut inner = self.lock();
        inner.tip = Some(node);
        insert_node(&mut inner, node);
        limit_cache(&mut inner);
    }

    pub fn get_node_by_height(&self, height: u32) -> Result<Option<BlockNode>, BlockchainError> {
        if let Some(node) = self.lock().by_height.get(&height).copied() {
            return Ok(Some(node));
        }
        let Some(block_id) = ds::fetch_block_id_from_height(self.store.as_ref(), height)? else {
            return Ok(None);
        };
        let node = BlockNode { block_id, height };
        let mut inner = self.lock();
        insert_node(&mut inner, node);
        limit_cache(&mut inner);
        Ok(Some(node))
    }

    pub fn get_node_by_id(&self, block_id: &Hash256) -> Result<Option<BlockNode>, BlockchainError> {
        if let Some(node) = self.lock().by_id.get(block_id).copied() {
            return Ok(Some(node));
        }
        let Some(header) = ds::fetch_header(self.store.as_ref(), block_id)? else {
            return Ok(None);
        };
        let node = BlockNode {
            block_id: *block_id,
            height: header.height,
        };
        let mut inner = self.lock();
        insert_node(&mut inner, node);
        limit_cache(&mut inner);
        Ok(Some(node))
    }

    /// The node one height below, if this is not the genesis block.
    pub fn parent_of(&self, node: &BlockNode) -> Result<Option<BlockNode>, BlockchainError> {
        if node.height == 0 {
            return Ok(None);
        }
        self.get_node_by_height(node.height - 1)
    }

    /// The node one height above, if one has been accepted.
    pub fn child_of(&self, node: &BlockNode) -> Result<Option<BlockNode>, BlockchainError> {
        self.get_node_by_height(node.height + 1)
    }

    /// The header for a cached node, loaded from the datastore.
    pub fn header(&self, node: &BlockNode) -> Result<BlockHeader, BlockchainError> {
        ds::fetch_header(self.store.as_ref(), &node.block_id)?
            .ok_or(BlockchainError::NotFound("block header"))
    }

    /// The full block for a cached node, loaded from the datastore.
    pub fn block(&self, node: &BlockNode) -> Result<Block, BlockchainError> {
        ds::fetch_block(self.store.as_ref(), &node.block_id)?
            .ok_or(BlockchainError::NotFound("block"))
    }

    pub fn cached_len(&self) -> usize {
        self.lock().by_id.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn insert_node(inner: &mut IndexInner, node: BlockNode) {
    inner.by_id.insert(node.block_id, node);
    inner.by_height.insert(node.height, node);
}

fn limit_cache(inner: &mut IndexInner) {
    let tip = inner.tip;
    if inner.by_id.len() > BLOCK_INDEX_CACHE_SIZE {
        let victim = inner
            .by_id
            .keys()
            .find(|id| tip.map(|tip| tip.block_id != **id).unwrap_or(true))
            .copied();
        if let Some(id) = victim {
            inner.by_id.remove(&id);
        }
    }
    if inner.by_height.len() > BLOCK_INDEX_CACHE_SIZE {
        let victim = inner
            .by_height
            .keys()
            .find(|height| tip.map(|tip| tip.height != **height).unwrap_or(true))
            .copied();
        if let Some(height) = victim {
            inner.by_height.remove(&height);
        }
    }
}
