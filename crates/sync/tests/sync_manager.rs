//! End-to-end sync scenarios over mock collaborators: a scripted peer set
//! serving real (signed, merkle-committed) chains through the chain service
//! interface, a recording chain, and a counting verifier.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use tokio::sync::mpsc;

use noct_chain::{
    BehaviorFlags, BlockchainError, Chain, ChainScore, ProofCache, SigCache,
};
use noct_consensus::params::{Checkpoint, Network as ChainNetwork, NetworkParams};
use noct_consensus::Hash256;
use noct_primitives::block::{Block, BlockHeader, BlockTxs, CURRENT_VERSION};
use noct_primitives::merkle::transactions_merkle_root;
use noct_primitives::transaction::{
    CoinbaseTransaction, Output, StandardTransaction, Transaction,
};
use noct_sync::{
    ChainClient, ChainServiceError, Network, SyncManager, SyncManagerConfig, BAN_SCORE_HARD,
};
use noct_zk::{PublicParams, ValidationProgram, Verifier, VerifierError};

const STREAM_BATCH: usize = 2_000;

fn addr(n: u16) -> SocketAddr {
    format!("127.0.0.1:{}", 20_000 + n).parse().expect("addr")
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[0x42; 32])
}

fn make_coinbase(key: &SigningKey, height: u32, salt: u64) -> Transaction {
    let mut coinbase = CoinbaseTransaction {
        validator_id: key.verifying_key().to_bytes().to_vec(),
        new_coins: 50 + salt,
        outputs: vec![Output {
            commitment: [(height % 251) as u8; 32],
            ciphertext: height.to_le_bytes().to_vec(),
        }],
        signature: Vec::new(),
        proof: {
            let mut proof = height.to_le_bytes().to_vec();
            proof.extend_from_slice(&salt.to_le_bytes());
            proof
        },
    };
    let sig_hash = Transaction::Coinbase(coinbase.clone()).sig_hash();
    coinbase.signature = key.sign(&sig_hash).to_bytes().to_vec();
    Transaction::Coinbase(coinbase)
}

fn make_block(
    key: &SigningKey,
    height: u32,
    parent: Hash256,
    salt: u64,
    extra_txs: Vec<Transaction>,
) -> Block {
    let mut transactions = vec![make_coinbase(key, height, salt)];
    transactions.extend(extra_txs);
    let header = BlockHeader {
        version: CURRENT_VERSION,
        height,
        parent,
        tx_root: transactions_merkle_root(&transactions),
        timestamp: height as i64,
        producer: key.verifying_key().to_bytes().to_vec(),
        signature: Vec::new(),
    };
    Block {
        header,
        transactions,
    }
}

fn genesis(key: &SigningKey) -> Block {
    make_block(key, 0, [0u8; 32], 0, Vec::new())
}

/// Extend `prefix` up to and including `to_height` with blocks salted by
/// `salt`, returning the whole chain.
fn extend_chain(key: &SigningKey, prefix: &[Block], to_height: u32, salt: u64) -> Vec<Block> {
    let mut chain = prefix.to_vec();
    let mut parent = chain.last().expect("non-empty prefix").id();
    for height in chain.len() as u32..=to_height {
        let block = make_block(key, height, parent, salt, Vec::new());
        parent = block.id();
        chain.push(block);
    }
    chain
}

// --- mock chain ------------------------------------------------------------

struct MockChain {
    blocks: Mutex<Vec<Block>>,
    connects: Mutex<Vec<(u32, BehaviorFlags)>>,
    scores: Mutex<HashMap<Hash256, ChainScore>>,
}

impl MockChain {
    fn new(initial: Vec<Block>) -> Self {
        assert!(!initial.is_empty(), "chain starts at genesis");
        Self {
            blocks: Mutex::new(initial),
            connects: Mutex::new(Vec::new()),
            scores: Mutex::new(HashMap::new()),
        }
    }

    fn set_score(&self, window_first: Hash256, score: ChainScore) {
        self.scores
            .lock()
            .expect("scores")
            .insert(window_first, score);
    }

    fn connect_count(&self) -> usize {
        self.connects.lock().expect("connects").len()
    }

    fn connect_log(&self) -> Vec<(u32, BehaviorFlags)> {
        self.connects.lock().expect("connects").clone()
    }

    fn tip(&self) -> (Hash256, u32) {
        let blocks = self.blocks.lock().expect("blocks");
        let tip = blocks.last().expect("tip");
        (tip.id(), tip.header.height)
    }
}

impl Chain for MockChain {
    fn best_block(&self) -> (Hash256, u32) {
        self.tip()
    }

    fn calc_chain_score(
        &self,
        blocks: &[Block],
        _flags: BehaviorFlags,
    ) -> Result<ChainScore, BlockchainError> {
        let first = blocks
            .first()
            .ok_or(BlockchainError::NotFound("empty window"))?;
        Ok(self
            .scores
            .lock()
            .expect("scores")
            .get(&first.id())
            .copied()
            .unwrap_or(1_000))
    }

    fn connect_block(&self, block: &Block, flags: BehaviorFlags) -> Result<(), BlockchainError> {
        let mut blocks = self.blocks.lock().expect("blocks");
        let tip = blocks.last().expect("tip");
        if block.header.parent != tip.id() {
            return Err(BlockchainError::InvalidBlock(format!(
                "block {} does not extend tip {}",
                block.header.height,
                tip.header.height
            )));
        }
        if block.header.height != tip.header.height + 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "block height {} out of order",
                block.header.height
            )));
        }
        blocks.push(block.clone());
        self.connects
            .lock()
            .expect("connects")
            .push((block.header.height, flags));
        Ok(())
    }
}

// --- mock network ----------------------------------------------------------

#[derive(Default)]
struct MockNetwork {
    peers: Mutex<Vec<SocketAddr>>,
    scores: Mutex<HashMap<SocketAddr, (u32, u32)>>,
    hooks: Mutex<Vec<Box<dyn Fn(SocketAddr) + Send + Sync>>>,
}

impl MockNetwork {
    fn new(peers: Vec<SocketAddr>) -> Self {
        Self {
            peers: Mutex::new(peers),
            ..Self::default()
        }
    }

    fn hard_banned(&self) -> Vec<SocketAddr> {
        self.scores
            .lock()
            .expect("scores")
            .iter()
            .filter(|(_, (hard, _))| *hard >= BAN_SCORE_HARD)
            .map(|(peer, _)| *peer)
            .collect()
    }

    fn disconnect(&self, peer: SocketAddr) {
        self.peers.lock().expect("peers").retain(|p| *p != peer);
        let hooks = self.hooks.lock().expect("hooks");
        for hook in hooks.iter() {
            hook(peer);
        }
    }
}

impl Network for MockNetwork {
    fn sync_peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().expect("peers").clone()
    }

    fn increase_banscore(&self, peer: SocketAddr, hard: u32, soft: u32) {
        let crossed = {
            let mut scores = self.scores.lock().expect("scores");
            let entry = scores.entry(peer).or_insert((0, 0));
            entry.0 += hard;
            entry.1 += soft;
            entry.0 >= BAN_SCORE_HARD
        };
        if crossed {
            self.disconnect(peer);
        }
    }

    fn on_peer_disconnect(&self, hook: Box<dyn Fn(SocketAddr) + Send + Sync>) {
        self.hooks.lock().expect("hooks").push(hook);
    }
}

// --- mock chain service client ---------------------------------------------

#[derive(Default)]
struct MockClient {
    chains: Mutex<HashMap<SocketAddr, Arc<Vec<Block>>>>,
    /// Peers that claim `NotFound` for any height above the limit while
    /// still advertising their full best. Models a peer contradicting
    /// itself.
    notfound_above: Mutex<HashMap<SocketAddr, u32>>,
}

impl MockClient {
    fn new() -> Self {
        Self::default()
    }

    fn serve(&self, peer: SocketAddr, chain: Arc<Vec<Block>>) {
        self.chains.lock().expect("chains").insert(peer, chain);
    }

    fn set_notfound_above(&self, peer: SocketAddr, limit: u32) {
        self.notfound_above
            .lock()
            .expect("notfound")
            .insert(peer, limit);
    }

    fn chain_of(&self, peer: SocketAddr) -> Result<Arc<Vec<Block>>, ChainServiceError> {
        self.chains
            .lock()
            .expect("chains")
            .get(&peer)
            .cloned()
            .ok_or_else(|| ChainServiceError::Transport("unknown peer".to_string()))
    }
}

#[async_trait]
impl ChainClient for MockClient {
    async fn get_best(&self, peer: SocketAddr) -> Result<(Hash256, u32), ChainServiceError> {
        let chain = self.chain_of(peer)?;
        let tip = chain.last().expect("chain non-empty");
        Ok((tip.id(), tip.header.height))
    }

    async fn get_block_id(
        &self,
        peer: SocketAddr,
        height: u32,
    ) -> Result<Hash256, ChainServiceError> {
        if let Some(limit) = self.notfound_above.lock().expect("notfound").get(&peer) {
            if height > *limit {
                return Err(ChainServiceError::NotFound);
            }
        }
        let chain = self.chain_of(peer)?;
        chain
            .get(height as usize)
            .map(|block| block.id())
            .ok_or(ChainServiceError::NotFound)
    }

    async fn get_headers_stream(
        &self,
        peer: SocketAddr,
        from_height: u32,
    ) -> Result<mpsc::Receiver<BlockHeader>, ChainServiceError> {
        let chain = self.chain_of(peer)?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let from = from_height as usize;
            for block in chain.iter().skip(from).take(STREAM_BATCH) {
                if tx.send(block.header.clone()).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn get_block_txs_stream(
        &self,
        peer: SocketAddr,
        from_height: u32,
    ) -> Result<mpsc::Receiver<BlockTxs>, ChainServiceError> {
        let chain = self.chain_of(peer)?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let from = from_height as usize;
            for block in chain.iter().skip(from).take(STREAM_BATCH) {
                let txs = BlockTxs {
                    transactions: block.transactions.clone(),
                };
                if tx.send(txs).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// --- mock verifier ----------------------------------------------------------

struct MockVerifier {
    calls: AtomicUsize,
    /// While set, every verify call parks until it is cleared.
    gate: AtomicBool,
    proof_calls: Mutex<HashMap<Vec<u8>, usize>>,
}

impl MockVerifier {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: AtomicBool::new(false),
            proof_calls: Mutex::new(HashMap::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn calls_for_proof(&self, proof: &[u8]) -> usize {
        self.proof_calls
            .lock()
            .expect("proof calls")
            .get(proof)
            .copied()
            .unwrap_or(0)
    }

    fn set_gate(&self, blocked: bool) {
        self.gate.store(blocked, Ordering::SeqCst);
    }
}

impl Verifier for MockVerifier {
    fn verify(
        &self,
        _program: ValidationProgram,
        _params: &PublicParams,
        proof: &[u8],
    ) -> Result<bool, VerifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .proof_calls
            .lock()
            .expect("proof calls")
            .entry(proof.to_vec())
            .or_insert(0) += 1;
        while self.gate.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(true)
    }
}

// --- harness ---------------------------------------------------------------

fn test_params(checkpoints: Vec<Checkpoint>) -> Arc<NetworkParams> {
    Arc::new(NetworkParams {
        network: ChainNetwork::Regtest,
        name: "regtest",
        protocol_prefix: "/noct/regtest",
        genesis_id: [0x01; 32],
        checkpoints,
        default_port: 9003,
    })
}

#[allow(clippy::type_complexity)]
fn build_manager(
    params: Arc<NetworkParams>,
    chain: Arc<MockChain>,
    network: Arc<MockNetwork>,
    client: Arc<MockClient>,
    verifier: Arc<MockVerifier>,
    chooser: Box<dyn Fn(&[Block]) -> Result<Hash256, String> + Send + Sync>,
) -> (Arc<SyncManager>, Arc<AtomicUsize>) {
    let current_calls = Arc::new(AtomicUsize::new(0));
    let callback_calls = Arc::clone(&current_calls);
    let manager = SyncManager::new(SyncManagerConfig {
        params,
        chain,
        network,
        client,
        chooser,
        proof_cache: Arc::new(ProofCache::new(100_000)),
        sig_cache: Arc::new(SigCache::new(100_000)),
        verifier,
        is_current_callback: Some(Box::new(move || {
            callback_calls.fetch_add(1, Ordering::SeqCst);
        })),
    });
    (Arc::new(manager), current_calls)
}

fn no_chooser() -> Box<dyn Fn(&[Block]) -> Result<Hash256, String> + Send + Sync> {
    Box::new(|_| Err("consensus chooser not expected".to_string()))
}

async fn run_to_current(manager: &Arc<SyncManager>) {
    tokio::time::timeout(Duration::from_secs(120), manager.start())
        .await
        .expect("sync session should finish");
}

fn assert_heights_ascend(log: &[(u32, BehaviorFlags)]) {
    for pair in log.windows(2) {
        assert!(
            pair[1].0 == pair[0].0 + 1,
            "connect heights must ascend without gaps: {} then {}",
            pair[0].0,
            pair[1].0
        );
    }
}

// --- scenarios -------------------------------------------------------------

/// Happy path, no fork: every peer follows the same chain; the manager
/// syncs lookahead-sized stretches until no peer knows a higher block, then
/// flags current exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_syncs_to_tip_and_sets_current_once() {
    let key = signing_key();
    let chain_blocks = Arc::new(extend_chain(&key, &[genesis(&key)], 25_000, 0));

    let peers: Vec<SocketAddr> = (0..20).map(addr).collect();
    let network = Arc::new(MockNetwork::new(peers.clone()));
    let client = Arc::new(MockClient::new());
    for peer in &peers {
        client.serve(*peer, Arc::clone(&chain_blocks));
    }
    let chain = Arc::new(MockChain::new(vec![chain_blocks[0].clone()]));
    let verifier = Arc::new(MockVerifier::new());

    let (manager, current_calls) = build_manager(
        test_params(Vec::new()),
        Arc::clone(&chain),
        Arc::clone(&network),
        Arc::clone(&client),
        Arc::clone(&verifier),
        no_chooser(),
    );

    run_to_current(&manager).await;

    assert!(manager.is_current());
    assert_eq!(current_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chain.connect_count(), 25_000);
    let log = chain.connect_log();
    assert_eq!(log.first().map(|(height, _)| *height), Some(1));
    assert_eq!(log.last().map(|(height, _)| *height), Some(25_000));
    assert_heights_ascend(&log);
    assert_eq!(chain.tip().0, chain_blocks.last().expect("tip").id());
    assert!(network.hard_banned().is_empty());

    // Close resets the current flag; the one-shot callback stays spent.
    manager.close().await;
    assert!(!manager.is_current());
    assert_eq!(current_calls.load(Ordering::SeqCst), 1);
}

/// Checkpoint fast-forward: blocks at or below the last checkpoint are
/// connected with FastAdd and neither validator runs.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoints_fast_forward_without_validation() {
    let key = signing_key();
    let chain_blocks = Arc::new(extend_chain(&key, &[genesis(&key)], 5_000, 0));
    let checkpoints = vec![
        Checkpoint {
            height: 1_000,
            block_id: chain_blocks[1_000].id(),
        },
        Checkpoint {
            height: 5_000,
            block_id: chain_blocks[5_000].id(),
        },
    ];

    let peers: Vec<SocketAddr> = (0..12).map(addr).collect();
    let network = Arc::new(MockNetwork::new(peers.clone()));
    let client = Arc::new(MockClient::new());
    for peer in &peers {
        client.serve(*peer, Arc::clone(&chain_blocks));
    }
    let chain = Arc::new(MockChain::new(vec![chain_blocks[0].clone()]));
    let verifier = Arc::new(MockVerifier::new());

    let (manager, _) = build_manager(
        test_params(checkpoints),
        Arc::clone(&chain),
        network,
        client,
        Arc::clone(&verifier),
        no_chooser(),
    );

    run_to_current(&manager).await;

    assert_eq!(chain.connect_count(), 5_000);
    assert_eq!(verifier.call_count(), 0, "FastAdd must skip the verifier");
    let log = chain.connect_log();
    assert_heights_ascend(&log);
    assert!(
        log.iter().all(|(_, flags)| flags.fast_add),
        "checkpointed blocks must be connected with FastAdd"
    );
    assert_eq!(chain.tip().1, 5_000);
}

/// Clean fork near the tip: both evaluation windows are short, so the
/// consensus chooser picks the winner; every peer on the losing side is
/// hard-banned.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn near_tip_fork_settled_by_consensus_chooser() {
    let key = signing_key();
    let common = extend_chain(&key, &[genesis(&key)], 10_000, 0);
    let side_a = Arc::new(extend_chain(&key, &common, 10_050, 0xaa));
    let side_b = Arc::new(extend_chain(&key, &common, 10_050, 0xbb));
    let a_first = side_a[10_001].id();

    let a_peers: Vec<SocketAddr> = (0..10).map(addr).collect();
    let b_peers: Vec<SocketAddr> = (10..20).map(addr).collect();
    let mut peers = a_peers.clone();
    peers.extend(&b_peers);
    let network = Arc::new(MockNetwork::new(peers));
    let client = Arc::new(MockClient::new());
    for peer in &a_peers {
        client.serve(*peer, Arc::clone(&side_a));
    }
    for peer in &b_peers {
        client.serve(*peer, Arc::clone(&side_b));
    }

    let chain = Arc::new(MockChain::new(common.clone()));
    let verifier = Arc::new(MockVerifier::new());
    let chooser_calls = Arc::new(AtomicUsize::new(0));
    let chooser_seen = Arc::clone(&chooser_calls);
    let chooser: Box<dyn Fn(&[Block]) -> Result<Hash256, String> + Send + Sync> =
        Box::new(move |blocks| {
            chooser_seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(blocks.len(), 2, "one first-block per candidate");
            Ok(a_first)
        });

    let (manager, _) = build_manager(
        test_params(Vec::new()),
        Arc::clone(&chain),
        Arc::clone(&network),
        client,
        verifier,
        chooser,
    );

    run_to_current(&manager).await;

    assert_eq!(chooser_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chain.tip().0, side_a.last().expect("tip").id());
    let banned = network.hard_banned();
    for peer in &b_peers {
        assert!(banned.contains(peer), "losing side must be hard-banned");
    }
    for peer in &a_peers {
        assert!(!banned.contains(peer), "winning side must not be banned");
    }
}

/// Deep fork resolved by chain score: both windows are full, the lower
/// score wins, and the consensus chooser is never consulted.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deep_fork_resolved_by_chain_score() {
    let key = signing_key();
    let common = extend_chain(&key, &[genesis(&key)], 10_000, 0);
    let side_a = Arc::new(extend_chain(&key, &common, 16_000, 0xaa));
    let side_b = Arc::new(extend_chain(&key, &common, 16_000, 0xbb));

    let a_peers: Vec<SocketAddr> = (0..10).map(addr).collect();
    let b_peers: Vec<SocketAddr> = (10..20).map(addr).collect();
    let mut peers = a_peers.clone();
    peers.extend(&b_peers);
    let network = Arc::new(MockNetwork::new(peers));
    let client = Arc::new(MockClient::new());
    for peer in &a_peers {
        client.serve(*peer, Arc::clone(&side_a));
    }
    for peer in &b_peers {
        client.serve(*peer, Arc::clone(&side_b));
    }

    let chain = Arc::new(MockChain::new(common.clone()));
    chain.set_score(side_a[10_001].id(), 800);
    chain.set_score(side_b[10_001].id(), 500);
    let verifier = Arc::new(MockVerifier::new());

    let (manager, _) = build_manager(
        test_params(Vec::new()),
        Arc::clone(&chain),
        Arc::clone(&network),
        client,
        verifier,
        no_chooser(),
    );

    run_to_current(&manager).await;

    // B scored lower, so the local chain must follow B to its tip.
    assert_eq!(chain.tip().0, side_b.last().expect("tip").id());
    assert_eq!(chain.tip().1, 16_000);
    let banned = network.hard_banned();
    for peer in &a_peers {
        assert!(banned.contains(peer), "high-score side must be hard-banned");
    }
    for peer in &b_peers {
        assert!(!banned.contains(peer));
    }
    let log = chain.connect_log();
    assert_heights_ascend(&log);
}

/// A peer that advertises a tip it cannot back up: it reports a high best
/// but claims NotFound for the fork-search midpoint. The fallback best is
/// out of range for its own claim, which is a protocol violation worth a
/// hard ban; sync then completes against the honest majority.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lying_lookahead_peer_is_hard_banned() {
    let key = signing_key();
    let common = extend_chain(&key, &[genesis(&key)], 3_000, 0);
    let honest = Arc::new(extend_chain(&key, &common, 12_000, 0));
    let liar_chain = Arc::new(extend_chain(&key, &common, 11_000, 0xcc));

    let honest_peers: Vec<SocketAddr> = (0..19).map(addr).collect();
    let liar = addr(19);
    let mut peers = honest_peers.clone();
    peers.push(liar);
    let network = Arc::new(MockNetwork::new(peers));
    let client = Arc::new(MockClient::new());
    for peer in &honest_peers {
        client.serve(*peer, Arc::clone(&honest));
    }
    client.serve(liar, Arc::clone(&liar_chain));
    // The liar answers GetBlockID only below the fork while its GetBest
    // still advertises 11_000.
    client.set_notfound_above(liar, 3_000);

    let chain = Arc::new(MockChain::new(vec![common[0].clone()]));
    let verifier = Arc::new(MockVerifier::new());

    let (manager, _) = build_manager(
        test_params(Vec::new()),
        Arc::clone(&chain),
        Arc::clone(&network),
        client,
        verifier,
        no_chooser(),
    );

    run_to_current(&manager).await;

    assert!(network.hard_banned().contains(&liar));
    for peer in &honest_peers {
        assert!(!network.hard_banned().contains(peer));
    }
    assert_eq!(chain.tip().0, honest.last().expect("tip").id());
    assert_eq!(chain.tip().1, 12_000);
}

/// The same transaction seen twice in one session: the second occurrence
/// hits the proof cache and the verifier is not called again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_proof_hits_cache() {
    let key = signing_key();
    let duplicate = Transaction::Standard(StandardTransaction {
        outputs: vec![Output {
            commitment: [0x77; 32],
            ciphertext: vec![0x01, 0x02],
        }],
        nullifiers: vec![[0x78; 32]],
        txo_root: [0x79; 32],
        fee: 5,
        locktime: 0,
        proof: vec![0xde, 0xad, 0xbe, 0xef],
    });

    // The duplicate rides in two different blocks, far enough apart to land
    // in different validation batches.
    let mut blocks = vec![genesis(&key)];
    let mut parent = blocks[0].id();
    for height in 1..=1_200u32 {
        let extra = if height == 1 || height == 1_001 {
            vec![duplicate.clone()]
        } else {
            Vec::new()
        };
        let block = make_block(&key, height, parent, 0, extra);
        parent = block.id();
        blocks.push(block);
    }
    let chain_blocks = Arc::new(blocks);

    let peers: Vec<SocketAddr> = (0..8).map(addr).collect();
    let network = Arc::new(MockNetwork::new(peers.clone()));
    let client = Arc::new(MockClient::new());
    for peer in &peers {
        client.serve(*peer, Arc::clone(&chain_blocks));
    }
    let chain = Arc::new(MockChain::new(vec![chain_blocks[0].clone()]));
    let verifier = Arc::new(MockVerifier::new());

    let (manager, _) = build_manager(
        test_params(Vec::new()),
        Arc::clone(&chain),
        network,
        client,
        Arc::clone(&verifier),
        no_chooser(),
    );

    run_to_current(&manager).await;

    assert_eq!(chain.connect_count(), 1_200);
    assert_eq!(
        verifier.calls_for_proof(&[0xde, 0xad, 0xbe, 0xef]),
        1,
        "second occurrence must be served from the proof cache"
    );
}

/// Close during a mid-batch validation: nothing from the aborted batch is
/// connected, and a fresh start resumes from the committed tip.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_mid_batch_commits_nothing_and_resumes() {
    let key = signing_key();
    let chain_blocks = Arc::new(extend_chain(&key, &[genesis(&key)], 600, 0));

    let peers: Vec<SocketAddr> = (0..8).map(addr).collect();
    let network = Arc::new(MockNetwork::new(peers.clone()));
    let client = Arc::new(MockClient::new());
    for peer in &peers {
        client.serve(*peer, Arc::clone(&chain_blocks));
    }
    let chain = Arc::new(MockChain::new(vec![chain_blocks[0].clone()]));
    let verifier = Arc::new(MockVerifier::new());
    // Park the first batch inside the verifier so the close lands
    // mid-validation no matter how fast the host is.
    verifier.set_gate(true);

    let (manager, current_calls) = build_manager(
        test_params(Vec::new()),
        Arc::clone(&chain),
        network,
        client,
        Arc::clone(&verifier),
        no_chooser(),
    );

    let runner = Arc::clone(&manager);
    let session = tokio::spawn(async move { runner.start().await });

    // Wait for the session to enter the first validation batch.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(verifier.call_count() > 0, "batch validation should be underway");

    let closer = Arc::clone(&manager);
    let close_task = tokio::spawn(async move { closer.close().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    verifier.set_gate(false);
    close_task.await.expect("close task");
    session.await.expect("session task");

    assert_eq!(
        chain.connect_count(),
        0,
        "no block from the aborted batch may be committed"
    );
    assert!(!manager.is_current());
    assert_eq!(current_calls.load(Ordering::SeqCst), 0);

    // Restart; the session resumes from the last committed tip and
    // finishes.
    run_to_current(&manager).await;
    assert_eq!(chain.connect_count(), 600);
    assert!(manager.is_current());
    let log = chain.connect_log();
    assert_heights_ascend(&log);
}

/// A disconnect hook keeps bucket membership a partition: the disconnected
/// peer is gone from every bucket and is not queried again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnects_prune_buckets_mid_session() {
    let key = signing_key();
    let chain_blocks = Arc::new(extend_chain(&key, &[genesis(&key)], 12_000, 0));

    let peers: Vec<SocketAddr> = (0..10).map(addr).collect();
    let network = Arc::new(MockNetwork::new(peers.clone()));
    let client = Arc::new(MockClient::new());
    for peer in &peers {
        client.serve(*peer, Arc::clone(&chain_blocks));
    }
    let chain = Arc::new(MockChain::new(vec![chain_blocks[0].clone()]));
    let verifier = Arc::new(MockVerifier::new());

    let (manager, _) = build_manager(
        test_params(Vec::new()),
        Arc::clone(&chain),
        Arc::clone(&network),
        client,
        verifier,
        no_chooser(),
    );

    // Disconnect a peer shortly into the session.
    let net = Arc::clone(&network);
    let victim = peers[3];
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(6)).await;
        net.disconnect(victim);
    });

    run_to_current(&manager).await;

    assert!(manager.is_current());
    assert_eq!(chain.tip().1, 12_000);
    assert!(!network.sync_peers().contains(&victim));
}
