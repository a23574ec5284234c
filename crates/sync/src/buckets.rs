//! Peer buckets: peers grouped by the best tip they advertise.
//!
//! Buckets are only used to widen queries so forks are surfaced as the
//! chain syncs forward. Because peers answer `get_best` at slightly
//! different moments, peers on the same chain may briefly land in different
//! buckets; that is harmless.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::RwLock;

use rand::seq::SliceRandom;

use noct_consensus::Hash256;

#[derive(Default)]
pub struct PeerBuckets {
    buckets: RwLock<HashMap<Hash256, Vec<SocketAddr>>>,
}

impl PeerBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole bucket map in one step.
    pub fn replace(&self, buckets: HashMap<Hash256, Vec<SocketAddr>>) {
        if let Ok(mut guard) = self.buckets.write() {
            *guard = buckets;
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Remove a disconnected peer from every bucket; buckets left empty
    /// disappear.
    pub fn remove_peer(&self, peer: &SocketAddr) {
        let Ok(mut guard) = self.buckets.write() else {
            return;
        };
        for members in guard.values_mut() {
            members.retain(|member| member != peer);
        }
        guard.retain(|_, members| !members.is_empty());
    }

    /// Extend `to_query` with one random member of every bucket that has no
    /// member in the list yet.
    pub fn add_query_peers(&self, to_query: &mut Vec<SocketAddr>) {
        let Ok(guard) = self.buckets.read() else {
            return;
        };
        let mut covered: HashSet<SocketAddr> = to_query.iter().copied().collect();
        for members in guard.values() {
            if members.iter().any(|member| covered.contains(member)) {
                continue;
            }
            if let Some(peer) = members.choose(&mut rand::thread_rng()) {
                covered.insert(*peer);
                to_query.push(*peer);
            }
        }
    }

    /// Remove the whole bucket containing `peer` and return its members.
    pub fn remove_bucket_of(&self, peer: &SocketAddr) -> Vec<SocketAddr> {
        let Ok(mut guard) = self.buckets.write() else {
            return Vec::new();
        };
        let bucket_id = guard.iter().find_map(|(id, members)| {
            if members.contains(peer) {
                Some(*id)
            } else {
                None
            }
        });
        match bucket_id {
            Some(id) => guard.remove(&id).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Whether the peer is currently in any bucket.
    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.buckets
            .read()
            .map(|guard| guard.values().any(|members| members.contains(peer)))
            .unwrap_or(false)
    }
}
