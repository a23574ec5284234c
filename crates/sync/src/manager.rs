//! The sync state machine.
//!
//! One session runs at a time: checkpoints first, then bucketize the peer
//! set, then loop lookahead queries until no peer knows a block above the
//! local tip. Disagreements are narrowed to the fork point by binary search
//! and settled by chain score over an evaluation window, or by the
//! consensus chooser when a candidate window ends inside the window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;

use noct_chain::{
    BehaviorFlags, BlockchainError, CancelToken, Chain, ChainScore, ProofCache, ProofValidator,
    SigCache, SigValidator,
};
use noct_consensus::params::NetworkParams;
use noct_consensus::{hash256_to_hex, Hash256};
use noct_log::{log_debug, log_error, log_info, log_trace};
use noct_primitives::block::{Block, BlockHeader, BlockTxs};
use noct_primitives::merkle::transactions_merkle_root;
use noct_primitives::transaction::Transaction;
use noct_zk::Verifier;

use crate::buckets::PeerBuckets;
use crate::client::ChainClient;
use crate::error::{ChainServiceError, SyncError};
use crate::network::Network;

pub const NEXT_HEIGHT_QUERY_SIZE: usize = 8;
pub const BEST_HEIGHT_QUERY_SIZE: usize = 100;
pub const LOOKAHEAD_SIZE: u32 = 10_000;
pub const EVALUATION_WINDOW: u32 = 5_000;
pub const MAX_BATCH_SIZE: u32 = 500;

/// Ban score crossing the disconnect threshold immediately.
pub const BAN_SCORE_HARD: u32 = 101;
/// Availability penalty for unresponsive peers.
pub const BAN_SCORE_SOFT: u32 = 20;

const QUERY_RETRY_DELAY: Duration = Duration::from_secs(10);
const BUCKET_RETRY_DELAY: Duration = Duration::from_secs(1);
const CHECKPOINT_NO_PEER_DELAY: Duration = Duration::from_secs(5);
const CHECKPOINT_RETRY_DELAY: Duration = Duration::from_secs(1);
const PEER_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const PEER_WAIT_ROUNDS: usize = 50;
const STREAM_ITEM_DEADLINE: Duration = Duration::from_secs(5);

/// Polls the consensus engine to pick the best block among otherwise
/// equally eligible candidates.
pub type ConsensusChooser = Box<dyn Fn(&[Block]) -> Result<Hash256, String> + Send + Sync>;

pub type IsCurrentCallback = Box<dyn FnOnce() + Send>;

pub struct SyncManagerConfig {
    pub params: Arc<NetworkParams>,
    pub chain: Arc<dyn Chain>,
    pub network: Arc<dyn Network>,
    pub client: Arc<dyn ChainClient>,
    pub chooser: ConsensusChooser,
    pub proof_cache: Arc<ProofCache>,
    pub sig_cache: Arc<SigCache>,
    pub verifier: Arc<dyn Verifier>,
    /// Invoked once, the first time the chain catches up to the live tip.
    pub is_current_callback: Option<IsCurrentCallback>,
}

/// Trustlessly syncs the local chain to the best live tip.
pub struct SyncManager {
    params: Arc<NetworkParams>,
    chain: Arc<dyn Chain>,
    network: Arc<dyn Network>,
    client: Arc<dyn ChainClient>,
    chooser: ConsensusChooser,
    buckets: Arc<PeerBuckets>,
    proof_cache: Arc<ProofCache>,
    sig_cache: Arc<SigCache>,
    verifier: Arc<dyn Verifier>,
    behavior: BehaviorFlags,
    current: RwLock<bool>,
    callback: StdMutex<Option<IsCurrentCallback>>,
    sync_mtx: Mutex<()>,
    quit: StdMutex<watch::Sender<bool>>,
    cancel: StdMutex<CancelToken>,
}

impl SyncManager {
    pub fn new(cfg: SyncManagerConfig) -> Self {
        let buckets = Arc::new(PeerBuckets::new());
        let hook_buckets = Arc::clone(&buckets);
        cfg.network
            .on_peer_disconnect(Box::new(move |peer| hook_buckets.remove_peer(&peer)));

        let (quit_tx, _) = watch::channel(false);
        Self {
            params: cfg.params,
            chain: cfg.chain,
            network: cfg.network,
            client: cfg.client,
            chooser: cfg.chooser,
            buckets,
            proof_cache: cfg.proof_cache,
            sig_cache: cfg.sig_cache,
            verifier: cfg.verifier,
            behavior: BehaviorFlags::NONE,
            current: RwLock::new(false),
            callback: StdMutex::new(cfg.is_current_callback),
            sync_mtx: Mutex::new(()),
            quit: StdMutex::new(quit_tx),
            cancel: StdMutex::new(CancelToken::new()),
        }
    }

    /// Run one sync session to the live tip. Returns when the chain is
    /// current or [`SyncManager::close`] is called. Only one session runs at
    /// a time.
    pub async fn start(&self) {
        let _session = self.sync_mtx.lock().await;

        let mut quit = {
            let (tx, rx) = watch::channel(false);
            if let Ok(mut guard) = self.quit.lock() {
                *guard = tx;
            }
            rx
        };
        let cancel = {
            let token = CancelToken::new();
            if let Ok(mut guard) = self.cancel.lock() {
                *guard = token.clone();
            }
            token
        };

        let (_, start_height) = self.chain.best_block();

        // Sync up to the checkpoints if we're not already past them.
        if let Some(last) = self.params.last_checkpoint() {
            if start_height < last.height {
                log_trace!("syncing to checkpoints from height {start_height}");
                self.sync_to_checkpoints(start_height, &mut quit, &cancel)
                    .await;
            }
        }

        // Before starting, query a large peer sample to see whether any
        // forks are live, sorting peers into buckets by the fork they are
        // on.
        log_trace!("waiting for enough peers to start sync");
        self.wait_for_peers(&quit).await;
        loop {
            if *quit.borrow() {
                return;
            }
            match self.populate_peer_buckets().await {
                Ok(()) => break,
                Err(err) => {
                    log_debug!("peer bucket query failed: {err}");
                    if sleep_or_quit(&mut quit, BUCKET_RETRY_DELAY).await {
                        return;
                    }
                }
            }
        }
        log_trace!(
            "starting sync: peers={} buckets={}",
            self.network.sync_peers().len(),
            self.buckets.bucket_count()
        );

        loop {
            if *quit.borrow() || self.is_current() {
                return;
            }

            // Ask a subset of peers for the block they have well ahead of
            // our tip. One peer from every bucket is always included so a
            // live fork is discovered as we sync forward.
            let (best_id, height) = self.chain.best_block();
            log_trace!(
                "syncing blocks: height={height} to={} tip={}",
                height + LOOKAHEAD_SIZE,
                hash256_to_hex(&best_id)
            );

            let block_map = match self.query_peers_for_block_id(height + LOOKAHEAD_SIZE).await {
                Ok(map) => map,
                Err(err) => {
                    log_debug!("lookahead query failed: {err}");
                    if sleep_or_quit(&mut quit, QUERY_RETRY_DELAY).await {
                        return;
                    }
                    continue;
                }
            };

            if block_map.is_empty() {
                // No peer knows a block above our tip; we're caught up.
                self.set_current();
                return;
            }

            if block_map.len() == 1 {
                let (block_id, peer) = block_map[0];
                log_trace!(
                    "all query peers in agreement at {}: {}",
                    height + LOOKAHEAD_SIZE,
                    hash256_to_hex(&block_id)
                );
                if let Err(err) = self
                    .sync_blocks(
                        peer,
                        height + 1,
                        height + LOOKAHEAD_SIZE,
                        best_id,
                        block_id,
                        self.behavior,
                        &cancel,
                    )
                    .await
                {
                    log_debug!("error syncing blocks from {peer}: {err}");
                }
                continue;
            }

            // The queried peers disagree; resolve the fork.
            if let Err(err) = self
                .resolve_fork(height, best_id, &block_map, &cancel)
                .await
            {
                if matches!(err, SyncError::Cancelled) {
                    return;
                }
                log_debug!("fork resolution failed: {err}");
            }
        }
    }

    /// Stop the running session and reset. The manager can be started
    /// again afterwards. Safe to call at any time, repeatedly.
    pub async fn close(&self) {
        if let Ok(mut current) = self.current.write() {
            *current = false;
        }
        if let Ok(guard) = self.quit.lock() {
            let _ = guard.send(true);
        }
        if let Ok(guard) = self.cancel.lock() {
            guard.cancel();
        }
        // Wait for the session to unwind.
        let _session = self.sync_mtx.lock().await;
    }

    /// Whether the manager believes the chain is synced to the live tip.
    pub fn is_current(&self) -> bool {
        self.current.read().map(|current| *current).unwrap_or(false)
    }

    /// Mark the chain as caught up. Stops the sync loop and fires the
    /// one-shot callback on the first transition.
    pub fn set_current(&self) {
        {
            let Ok(mut current) = self.current.write() else {
                return;
            };
            if !*current {
                log_info!("blockchain synced to tip");
            }
            *current = true;
        }
        let callback = self.callback.lock().ok().and_then(|mut guard| guard.take());
        if let Some(callback) = callback {
            callback();
        }
    }

    async fn wait_for_peers(&self, quit: &watch::Receiver<bool>) {
        for _ in 0..PEER_WAIT_ROUNDS {
            if *quit.borrow() {
                return;
            }
            if self.network.sync_peers().len() >= BEST_HEIGHT_QUERY_SIZE {
                return;
            }
            tokio::time::sleep(PEER_WAIT_INTERVAL).await;
        }
    }

    /// Query a large random peer sample for their best block and group the
    /// respondents by the tip they follow. The bucket map is replaced whole.
    async fn populate_peer_buckets(&self) -> Result<(), SyncError> {
        let peers = self.network.sync_peers();
        if peers.is_empty() {
            return Err(SyncError::NoPeers);
        }
        let size = BEST_HEIGHT_QUERY_SIZE.min(peers.len());
        let to_query = sample_peers(&peers, size);

        let mut join_set = JoinSet::new();
        for peer in to_query {
            let client = Arc::clone(&self.client);
            let network = Arc::clone(&self.network);
            join_set.spawn(async move {
                match client.get_best(peer).await {
                    Ok((block_id, height)) => Some((peer, block_id, height)),
                    Err(ChainServiceError::NotCurrent) => None,
                    Err(_) => {
                        network.increase_banscore(peer, 0, BAN_SCORE_SOFT);
                        None
                    }
                }
            });
        }

        let mut buckets: HashMap<Hash256, Vec<SocketAddr>> = HashMap::new();
        let mut count = 0usize;
        while let Some(result) = join_set.join_next().await {
            let Ok(Some((peer, block_id, _height))) = result else {
                continue;
            };
            count += 1;
            buckets.entry(block_id).or_default().push(peer);
        }
        if count < size / 2 {
            return Err(SyncError::QueryQuorum);
        }
        self.buckets.replace(buckets);
        Ok(())
    }

    /// Ask a peer subset for the block id at `height`. Responses at or
    /// below our best are dropped. Returns one peer per distinct id, in
    /// arrival order.
    async fn query_peers_for_block_id(
        &self,
        height: u32,
    ) -> Result<Vec<(Hash256, SocketAddr)>, SyncError> {
        let peers = self.network.sync_peers();
        if peers.is_empty() {
            return Err(SyncError::NoPeers);
        }
        let (_, best_height) = self.chain.best_block();
        let size = NEXT_HEIGHT_QUERY_SIZE.min(peers.len());

        let mut to_query = sample_peers(&peers, size);
        // Add a peer from each bucket so that any fork out there is
        // discovered as we sync.
        self.buckets.add_query_peers(&mut to_query);

        let mut join_set = JoinSet::new();
        for peer in to_query {
            let client = Arc::clone(&self.client);
            let network = Arc::clone(&self.network);
            join_set.spawn(async move {
                match client.get_block_id(peer, height).await {
                    Ok(block_id) => Some((peer, block_id, height)),
                    Err(ChainServiceError::NotFound) => match client.get_best(peer).await {
                        Ok((block_id, best)) => Some((peer, block_id, best)),
                        Err(_) => {
                            network.increase_banscore(peer, 0, BAN_SCORE_SOFT);
                            None
                        }
                    },
                    Err(_) => {
                        network.increase_banscore(peer, 0, BAN_SCORE_SOFT);
                        None
                    }
                }
            });
        }

        let mut ret: Vec<(Hash256, SocketAddr)> = Vec::new();
        let mut count = 0usize;
        while let Some(result) = join_set.join_next().await {
            let Ok(Some((peer, block_id, reported_height))) = result else {
                continue;
            };
            count += 1;
            if reported_height > best_height && !ret.iter().any(|(id, _)| *id == block_id) {
                ret.push((block_id, peer));
            }
        }
        if count < size / 2 {
            return Err(SyncError::QueryQuorum);
        }
        Ok(ret)
    }

    async fn sync_to_checkpoints(
        &self,
        current_height: u32,
        quit: &mut watch::Receiver<bool>,
        cancel: &CancelToken,
    ) {
        let checkpoints = self.params.checkpoints.clone();
        for checkpoint in checkpoints {
            if checkpoint.height <= current_height {
                continue;
            }
            loop {
                if *quit.borrow() {
                    return;
                }
                let peers = self.network.sync_peers();
                if peers.is_empty() {
                    if sleep_or_quit(quit, CHECKPOINT_NO_PEER_DELAY).await {
                        return;
                    }
                    continue;
                }
                let Some(peer) = peers.choose(&mut rand::thread_rng()).copied() else {
                    continue;
                };
                let (parent, height) = self.chain.best_block();
                match self
                    .sync_blocks(
                        peer,
                        height + 1,
                        checkpoint.height,
                        parent,
                        checkpoint.block_id,
                        BehaviorFlags::FAST_ADD,
                        cancel,
                    )
                    .await
                {
                    Ok(()) => break,
                    Err(SyncError::Cancelled) => return,
                    Err(err) => {
                        log_debug!("error syncing checkpoints from {peer}: {err}");
                        if sleep_or_quit(quit, CHECKPOINT_RETRY_DELAY).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Settle a disagreement between queried peers: find the fork point,
    /// catch up to it, score each side's evaluation window (or ask the
    /// consensus chooser if any window ends at a candidate's tip), ban the
    /// losers, and extend along the winner.
    async fn resolve_fork(
        &self,
        height: u32,
        best_id: Hash256,
        block_map: &[(Hash256, SocketAddr)],
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        let (fork_block, fork_height) = self
            .find_fork_point(height, height + LOOKAHEAD_SIZE, block_map)
            .await?;
        log_trace!(
            "query peers not in agreement: fork height {fork_height}, fork block {}",
            hash256_to_hex(&fork_block)
        );

        // The chain up to the fork point is on every candidate chain, so it
        // is safe to take from any one peer.
        if fork_height > height {
            let Some((_, peer)) = block_map.first() else {
                return Err(SyncError::NoPeers);
            };
            self.sync_blocks(
                *peer,
                height + 1,
                fork_height,
                best_id,
                fork_block,
                self.behavior,
                cancel,
            )
            .await?;
        }

        let mut scores: Vec<(Hash256, ChainScore)> = Vec::new();
        let mut sync_to: HashMap<Hash256, Block> = HashMap::new();
        let mut tip_of_chain = false;
        let mut first_blocks: Vec<Block> = Vec::new();
        let mut first_map: HashMap<Hash256, Hash256> = HashMap::new();

        for (block_id, peer) in block_map {
            if *block_id == fork_block {
                continue;
            }
            let window = match self.download_eval_window(*peer, fork_height + 1).await {
                Ok(window) => window,
                Err(err) => {
                    log_debug!("sync peer {peer} failed to serve evaluation window: {err}");
                    self.network.increase_banscore(*peer, BAN_SCORE_HARD, 0);
                    return Err(err);
                }
            };
            let Some(first) = window.first().cloned() else {
                self.network.increase_banscore(*peer, BAN_SCORE_HARD, 0);
                return Err(SyncError::Protocol(format!(
                    "peer {peer} served empty evaluation window"
                )));
            };
            first_blocks.push(first.clone());

            let raw = match self.chain.calc_chain_score(&window, self.behavior) {
                Ok(score) => score,
                Err(err) => {
                    log_debug!("sync peer {peer} served invalid evaluation window: {err}");
                    self.network.increase_banscore(*peer, BAN_SCORE_HARD, 0);
                    return Err(SyncError::Chain(err));
                }
            };
            // A short window means this candidate's chain ends inside the
            // window. Normalize the score so sides stay comparable, and
            // remember that the race is at the live tip.
            let score = if (window.len() as u32) < EVALUATION_WINDOW {
                tip_of_chain = true;
                raw / window.len() as u64 * EVALUATION_WINDOW as u64
            } else {
                raw
            };
            scores.push((*block_id, score));
            if let Some(last) = window.last() {
                sync_to.insert(*block_id, last.clone());
            }
            first_map.insert(first.id(), *block_id);
        }

        let best_candidate = if tip_of_chain {
            // At the live tip an objective score can still be gamed by
            // whoever produced the most recent blocks, so let the consensus
            // engine pick among the first blocks of each side.
            log_trace!(
                "fork is near the tip of chain, using consensus chooser: fork height {fork_height}"
            );
            let chosen = (self.chooser)(&first_blocks).map_err(SyncError::Chooser)?;
            match first_map.get(&chosen) {
                Some(candidate) => *candidate,
                None => {
                    return Err(SyncError::Chooser(
                        "chooser returned unknown block".to_string(),
                    ));
                }
            }
        } else {
            // Objective choice: minimum score, first seen wins ties.
            let mut best_score = ChainScore::MAX;
            let mut best = None;
            for (block_id, score) in &scores {
                if *score < best_score {
                    best_score = *score;
                    best = Some(*block_id);
                }
            }
            match best {
                Some(candidate) => candidate,
                None => return Err(SyncError::Protocol("no fork candidates scored".to_string())),
            }
        };
        log_trace!("selected best chain {}", hash256_to_hex(&best_candidate));

        // Everyone following a losing fork is hard-banned, bucket by
        // bucket.
        if first_blocks.len() > 1 {
            for (block_id, peer) in block_map {
                if *block_id == best_candidate {
                    continue;
                }
                self.network.increase_banscore(*peer, BAN_SCORE_HARD, 0);
                for member in self.buckets.remove_bucket_of(peer) {
                    self.network.increase_banscore(member, BAN_SCORE_HARD, 0);
                }
            }
        }

        let Some(target) = sync_to.get(&best_candidate) else {
            return Err(SyncError::Protocol(
                "missing window for selected chain".to_string(),
            ));
        };
        let Some((_, winner_peer)) = block_map
            .iter()
            .find(|(block_id, _)| *block_id == best_candidate)
        else {
            return Err(SyncError::Protocol(
                "missing peer for selected chain".to_string(),
            ));
        };
        let (current_id, current_height) = self.chain.best_block();
        self.sync_blocks(
            *winner_peer,
            current_height + 1,
            target.header.height,
            current_id,
            target.id(),
            self.behavior,
            cancel,
        )
        .await
    }

    /// Binary-search the highest height at which every candidate peer still
    /// reports the same block id. On entry peers agree at `current_height`
    /// and disagree at `to_height`.
    async fn find_fork_point(
        &self,
        mut current_height: u32,
        mut to_height: u32,
        block_map: &[(Hash256, SocketAddr)],
    ) -> Result<(Hash256, u32), SyncError> {
        let start_height = current_height;
        let mut mid_point = current_height + (to_height - current_height) / 2;
        let mut prev_mid = mid_point;
        let mut mid_id: Hash256 = [0u8; 32];

        loop {
            let mut join_set = JoinSet::new();
            for (_, peer) in block_map {
                let peer = *peer;
                let client = Arc::clone(&self.client);
                let network = Arc::clone(&self.network);
                let get_height = mid_point;
                join_set.spawn(async move {
                    match client.get_block_id(peer, get_height).await {
                        Ok(block_id) => Ok(block_id),
                        Err(ChainServiceError::NotFound) => {
                            match client.get_best(peer).await {
                                Ok((block_id, best)) => {
                                    // A peer whose best is outside the
                                    // bracket contradicts its own earlier
                                    // answers.
                                    if best < start_height || best >= get_height {
                                        network.increase_banscore(peer, BAN_SCORE_HARD, 0);
                                        Err(SyncError::Protocol(format!(
                                            "fork peer {peer} not returning expected height"
                                        )))
                                    } else {
                                        Ok(block_id)
                                    }
                                }
                                Err(err) => Err(SyncError::Service(err)),
                            }
                        }
                        Err(err) => Err(SyncError::Service(err)),
                    }
                });
            }

            let mut ids: Vec<Hash256> = Vec::new();
            while let Some(result) = join_set.join_next().await {
                match result {
                    Ok(Ok(block_id)) => {
                        if !ids.contains(&block_id) {
                            ids.push(block_id);
                        }
                    }
                    Ok(Err(err)) => return Err(err),
                    Err(_) => {
                        return Err(SyncError::Protocol("fork query task failed".to_string()));
                    }
                }
            }

            if ids.len() > 1 {
                to_height = mid_point;
                mid_point = current_height + (mid_point - current_height) / 2;
            } else {
                current_height = mid_point;
                if let Some(block_id) = ids.first() {
                    mid_id = *block_id;
                }
                mid_point = mid_point + (to_height - mid_point) / 2;
            }
            if prev_mid == mid_point {
                return Ok((mid_id, mid_point));
            }
            prev_mid = mid_point;
        }
    }

    /// Fetch the evaluation window for one side of a fork: headers and
    /// transactions concurrently, zipped into blocks. The window may be
    /// shorter than [`EVALUATION_WINDOW`] if the peer's chain ends inside
    /// it.
    async fn download_eval_window(
        &self,
        peer: SocketAddr,
        from_height: u32,
    ) -> Result<Vec<Block>, SyncError> {
        let to_height = from_height + EVALUATION_WINDOW - 1;
        let (headers, txs) = tokio::join!(
            self.download_headers(peer, from_height, to_height),
            self.download_block_txs(peer, from_height, to_height),
        );
        let headers = match headers {
            Ok(headers) => headers,
            Err(err) => {
                self.network.increase_banscore(peer, 0, BAN_SCORE_SOFT);
                return Err(SyncError::Service(err));
            }
        };
        let txs = match txs {
            Ok(txs) => txs,
            Err(err) => {
                self.network.increase_banscore(peer, 0, BAN_SCORE_SOFT);
                return Err(SyncError::Service(err));
            }
        };
        let blocks = headers
            .into_iter()
            .zip(txs)
            .map(|(header, block_txs)| Block {
                header,
                transactions: block_txs.transactions,
            })
            .collect();
        Ok(blocks)
    }

    /// Download, verify, validate, and connect the blocks in
    /// `[from_height..to_height]` from one peer.
    ///
    /// The header chain is verified first: the last header must hash to
    /// `expected_id`, the first must extend `parent`, and every interior
    /// header must extend its predecessor. Transactions are then pulled in
    /// chunks; each chunk's merkle roots are checked against the headers,
    /// proofs and signatures are validated concurrently with one another,
    /// and the blocks are handed to the chain in height order.
    #[allow(clippy::too_many_arguments)]
    async fn sync_blocks(
        &self,
        peer: SocketAddr,
        from_height: u32,
        to_height: u32,
        parent: Hash256,
        expected_id: Hash256,
        flags: BehaviorFlags,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        let headers = match self.download_headers(peer, from_height, to_height).await {
            Ok(headers) => headers,
            Err(err) => {
                self.network.increase_banscore(peer, 0, BAN_SCORE_SOFT);
                return Err(SyncError::Service(err));
            }
        };
        let Some(last) = headers.last() else {
            self.network.increase_banscore(peer, 0, BAN_SCORE_SOFT);
            return Err(SyncError::Service(ChainServiceError::StreamClosed));
        };
        if last.id() != expected_id {
            self.network.increase_banscore(peer, BAN_SCORE_HARD, 0);
            return Err(SyncError::Protocol(format!(
                "peer {peer} returned last header with unexpected id"
            )));
        }
        if headers[0].parent != parent {
            self.network.increase_banscore(peer, BAN_SCORE_HARD, 0);
            return Err(SyncError::Protocol(format!(
                "peer {peer} returned first header with unexpected parent id"
            )));
        }
        for i in (1..headers.len()).rev() {
            if headers[i].parent != headers[i - 1].id() {
                self.network.increase_banscore(peer, BAN_SCORE_HARD, 0);
                return Err(SyncError::Protocol(format!(
                    "peer {peer} returned headers that do not connect"
                )));
            }
        }

        let end_height = headers[headers.len() - 1].height;
        let mut start = headers[0].height;
        let mut header_idx = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let stop = (start + MAX_BATCH_SIZE).min(end_height);
            let txs = match self.download_block_txs(peer, start, stop).await {
                Ok(txs) => txs,
                Err(err) => {
                    self.network.increase_banscore(peer, 0, BAN_SCORE_SOFT);
                    return Err(SyncError::Service(err));
                }
            };
            if header_idx + txs.len() > headers.len() {
                self.network.increase_banscore(peer, BAN_SCORE_HARD, 0);
                return Err(SyncError::Protocol(format!(
                    "peer {peer} served more block txs than headers"
                )));
            }

            let mut blocks = Vec::with_capacity(txs.len());
            for (offset, block_txs) in txs.into_iter().enumerate() {
                let header = headers[header_idx + offset].clone();
                let merkle_root = transactions_merkle_root(&block_txs.transactions);
                if merkle_root != header.tx_root {
                    self.network.increase_banscore(peer, BAN_SCORE_HARD, 0);
                    return Err(SyncError::Protocol(format!(
                        "peer {peer} invalid block download merkle root"
                    )));
                }
                blocks.push(Block {
                    header,
                    transactions: block_txs.transactions,
                });
            }
            header_idx += blocks.len();

            // Validate the proofs and signatures for the whole batch, the
            // two validators running concurrently with one another. This is
            // much faster than validating per block as each is connected;
            // the caches carry the results forward so the chain will not
            // re-validate.
            if !flags.skips_witness_validation() {
                let to_validate: Arc<Vec<Transaction>> = Arc::new(
                    blocks
                        .iter()
                        .flat_map(|block| block.transactions.iter().cloned())
                        .collect(),
                );

                let proof_validator =
                    ProofValidator::new(Arc::clone(&self.proof_cache), Arc::clone(&self.verifier));
                let sig_validator = SigValidator::new(Arc::clone(&self.sig_cache));
                let proof_txs = Arc::clone(&to_validate);
                let sig_txs = Arc::clone(&to_validate);
                let proof_cancel = cancel.clone();
                let sig_cancel = cancel.clone();

                let proof_task = tokio::task::spawn_blocking(move || {
                    proof_validator.validate(&proof_txs, &proof_cancel)
                });
                let sig_task =
                    tokio::task::spawn_blocking(move || sig_validator.validate(&sig_txs, &sig_cancel));
                let (proof_result, sig_result) = tokio::join!(proof_task, sig_task);

                check_validator_result(proof_result, peer, "invalid proof in batch")?;
                check_validator_result(sig_result, peer, "invalid signature in batch")?;
            }

            for block in &blocks {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                if let Err(err) = self.chain.connect_block(block, flags) {
                    return Err(SyncError::Validation(format!(
                        "error committing block from peer {peer}, height {}: {err}",
                        block.header.height
                    )));
                }
            }

            if stop == end_height {
                break;
            }
            start = stop + 1;
        }
        Ok(())
    }

    /// Pull consecutive headers from a peer, re-requesting as the peer's
    /// per-stream batch limit closes each stream. Returns the prefix
    /// actually served; errors only if nothing arrives at all.
    async fn download_headers(
        &self,
        peer: SocketAddr,
        start_height: u32,
        end_height: u32,
    ) -> Result<Vec<BlockHeader>, ChainServiceError> {
        let mut headers: Vec<BlockHeader> =
            Vec::with_capacity(end_height.saturating_sub(start_height) as usize + 1);
        let mut height = start_height;
        loop {
            let mut stream = self.client.get_headers_stream(peer, height).await?;
            let mut count = 0usize;
            loop {
                match timeout(STREAM_ITEM_DEADLINE, stream.recv()).await {
                    Err(_) => return Err(ChainServiceError::Timeout),
                    Ok(None) => break,
                    Ok(Some(header)) => {
                        headers.push(header);
                        height += 1;
                        if height > end_height {
                            return Ok(headers);
                        }
                        count += 1;
                    }
                }
            }
            if count == 0 {
                if headers.is_empty() {
                    return Err(ChainServiceError::StreamClosed);
                }
                break;
            }
            if height > end_height {
                break;
            }
        }
        Ok(headers)
    }

    /// Pull consecutive per-block transaction sets from a peer. Same
    /// re-request behavior as [`SyncManager::download_headers`].
    async fn download_block_txs(
        &self,
        peer: SocketAddr,
        start_height: u32,
        end_height: u32,
    ) -> Result<Vec<BlockTxs>, ChainServiceError> {
        let mut txs: Vec<BlockTxs> =
            Vec::with_capacity(end_height.saturating_sub(start_height) as usize + 1);
        let mut height = start_height;
        loop {
            let mut stream = self.client.get_block_txs_stream(peer, height).await?;
            let mut count = 0usize;
            loop {
                match timeout(STREAM_ITEM_DEADLINE, stream.recv()).await {
                    Err(_) => return Err(ChainServiceError::Timeout),
                    Ok(None) => break,
                    Ok(Some(block_txs)) => {
                        txs.push(block_txs);
                        height += 1;
                        if height > end_height {
                            return Ok(txs);
                        }
                        count += 1;
                    }
                }
            }
            if count == 0 {
                if txs.is_empty() {
                    return Err(ChainServiceError::StreamClosed);
                }
                break;
            }
            if height > end_height {
                break;
            }
        }
        Ok(txs)
    }
}

fn check_validator_result(
    result: Result<Result<(), BlockchainError>, tokio::task::JoinError>,
    peer: SocketAddr,
    message: &str,
) -> Result<(), SyncError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(BlockchainError::Cancelled)) => Err(SyncError::Cancelled),
        Ok(Err(_)) => Err(SyncError::Validation(format!(
            "error committing block from peer {peer}: {message}"
        ))),
        Err(err) => {
            log_error!("validator task failed: {err}");
            Err(SyncError::Validation(format!(
                "error committing block from peer {peer}: {message}"
            )))
        }
    }
}

fn sample_peers(peers: &[SocketAddr], size: usize) -> Vec<SocketAddr> {
    let mut sampled = peers.to_vec();
    sampled.shuffle(&mut rand::thread_rng());
    sampled.truncate(size);
    sampled
}

/// Sleep for `duration`, returning early with `true` if quit fires.
async fn sleep_or_quit(quit: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *quit.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        result = quit.changed() => {
            result.is_err() || *quit.borrow()
        }
    }
}
