//! Content-addressed caches of verified proofs and signatures.
//!
//! A hit means the exact bytes were verified for the exact context at some
//! earlier point. Lookups are triple-keyed: the stored bytes and context are
//! re-checked against the caller's so a hash collision cannot cross-validate.

use std::collections::HashMap;
use std::sync::RwLock;

use noct_consensus::Hash256;

pub const DEFAULT_PROOF_CACHE_SIZE: usize = 50_000;
pub const DEFAULT_SIG_CACHE_SIZE: usize = 100_000;

struct ProofEntry {
    proof: Vec<u8>,
    txid: Hash256,
}

/// Memoizes zero-knowledge proofs that have already been verified, keyed by
/// the hash of the proof bytes.
pub struct ProofCache {
    max_entries: usize,
    entries: RwLock<HashMap<Hash256, ProofEntry>>,
}

impl ProofCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn exists(&self, proof_hash: &Hash256, proof: &[u8], txid: &Hash256) -> bool {
        let Ok(entries) = self.entries.read() else {
            return false;
        };
        match entries.get(proof_hash) {
            Some(entry) => entry.proof == proof && entry.txid == *txid,
            None => false,
        }
    }

    /// Record a verified proof. Existing entries are never rewritten.
    pub fn add(&self, proof_hash: Hash256, proof: &[u8], txid: Hash256) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.contains_key(&proof_hash) {
            return;
        }
        if entries.len() >= self.max_entries {
            if let Some(victim) = entries.keys().next().copied() {
                entries.remove(&victim);
            }
        }
        entries.insert(
            proof_hash,
            ProofEntry {
                proof: proof.to_vec(),
                txid,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SigEntry {
    signature: Vec<u8>,
    public_key: Vec<u8>,
}

/// Memoizes signatures that have already been verified, keyed by the signed
/// message hash.
pub struct SigCache {
    max_entries: usize,
    entries: RwLock<HashMap<Hash256, SigEntry>>,
}

impl SigCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn exists(&self, sig_hash: &Hash256, signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(entries) = self.entries.read() else {
            return false;
        };
        match entries.get(sig_hash) {
            Some(entry) => entry.signature == signature && entry.public_key == public_key,
            None => false,
        }
    }

    pub fn add(&self, sig_hash: Hash256, signature: &[u8], public_key: &[u8]) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.contains_key(&sig_hash) {
            return;
        }
        if entries.len() >= self.max_entries {
            if let Some(victim) = entries.keys().next().copied() {
                entries.remove(&victim);
            }
        }
        entries.insert(
            sig_hash,
            SigEntry {
                signature: signature.to_vec(),
                public_key: public_key.to_vec(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
