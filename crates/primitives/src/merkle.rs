//! Merkle root over block transactions.

use noct_consensus::Hash256;

use crate::hash::sha256d;
use crate::transaction::Transaction;

/// Compute the merkle root committed to by a block header's `tx_root`.
/// An empty transaction list hashes to all zeros; odd layers duplicate the
/// final entry.
pub fn transactions_merkle_root(transactions: &[Transaction]) -> Hash256 {
    let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
    merkle_root(&txids)
}

pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut layer = txids.to_vec();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = layer[layer.len() - 1];
            layer.push(last);
        }
        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks(2) {
            next.push(merkle_hash_pair(&pair[0], &pair[1]));
        }
        layer = next;
    }
    layer[0]
}

fn merkle_hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(left);
    buf[32..64].copy_from_slice(right);
    sha256d(&buf)
}
