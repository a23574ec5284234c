//! Batched proof and signature validation across a worker pool.
//!
//! Both validators share one shape: transactions are fanned out over a
//! bounded work channel to OS threads, results drain back in submission
//! count, and the first failure aborts the batch. Verified witnesses land in
//! the proof/sig caches so the chain never re-validates them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use ed25519_dalek::{Signature, VerifyingKey};

use noct_primitives::hash::sha256d;
use noct_primitives::transaction::Transaction;
use noct_zk::Verifier;

use crate::cache::{ProofCache, SigCache};
use crate::error::BlockchainError;

/// Cooperative cancellation signal shared between a validation batch and
/// its owner. Cancelling makes in-flight batches fail with
/// [`BlockchainError::Cancelled`] without caching anything further.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

fn worker_count(txs: usize) -> usize {
    let cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 3).max(1).min(txs.max(1))
}

/// Fan `txs` out over a worker pool, applying `check` to each. Returns the
/// first failure, cancelling outstanding work.
fn validate_batch<F>(
    txs: &[Transaction],
    cancel: &CancelToken,
    check: F,
) -> Result<(), BlockchainError>
where
    F: Fn(&Transaction) -> Result<(), BlockchainError> + Sync,
{
    if txs.is_empty() {
        return Ok(());
    }

    let workers = worker_count(txs.len());
    let abort = AtomicBool::new(false);
    let (work_tx, work_rx) = bounded::<&Transaction>(workers);
    let (result_tx, result_rx) = unbounded::<Result<(), BlockchainError>>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let check = &check;
            let abort = &abort;
            let cancel = cancel.clone();
            scope.spawn(move || {
                while let Ok(tx) = work_rx.recv() {
                    if abort.load(Ordering::Relaxed) || cancel.is_cancelled() {
                        // Keep draining so the feeder can finish.
                        let _ = result_tx.send(Err(BlockchainError::Cancelled));
                        continue;
                    }
                    if result_tx.send(check(tx)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        scope.spawn(move || {
            for tx in txs {
                if work_tx.send(tx).is_err() {
                    break;
                }
            }
        });

        let mut first_err = None;
        for _ in 0..txs.len() {
            match result_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    abort.store(true, Ordering::Relaxed);
                    first_err = Some(err);
                    break;
                }
                Err(_) => break,
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

/// Validates transaction zero-knowledge proofs in parallel. Proofs already
/// present in the cache are accepted without calling the verifier.
pub struct ProofValidator {
    proof_cache: Arc<ProofCache>,
    verifier: Arc<dyn Verifier>,
}

impl ProofValidator {
    pub fn new(proof_cache: Arc<ProofCache>, verifier: Arc<dyn Verifier>) -> Self {
        Self {
            proof_cache,
            verifier,
        }
    }

    pub fn validate(
        &self,
        txs: &[Transaction],
        cancel: &CancelToken,
    ) -> Result<(), BlockchainError> {
        validate_batch(txs, cancel, |tx| self.check_proof(tx))
    }

    fn check_proof(&self, tx: &Transaction) -> Result<(), BlockchainError> {
        let proof = tx.proof();
        let proof_hash = sha256d(proof);
        let txid = tx.txid();
        if self.proof_cache.exists(&proof_hash, proof, &txid) {
            return Ok(());
        }
        let params = tx.public_params();
        let valid = self
            .verifier
            .verify(tx.validation_program(), &params, proof)?;
        if !valid {
            return Err(BlockchainError::InvalidTx("invalid zk proof"));
        }
        self.proof_cache.add(proof_hash, proof, txid);
        Ok(())
    }
}

/// Validates transaction signatures in parallel. Transaction kinds that
/// carry no signature pass trivially.
pub struct SigValidator {
    sig_cache: Arc<SigCache>,
}

impl SigValidator {
    pub fn new(sig_cache: Arc<SigCache>) -> Self {
        Self { sig_cache }
    }

    pub fn validate(
        &self,
        txs: &[Transaction],
        cancel: &CancelToken,
    ) -> Result<(), BlockchainError> {
        validate_batch(txs, cancel, |tx| self.check_sig(tx))
    }

    fn check_sig(&self, tx: &Transaction) -> Result<(), BlockchainError> {
        let Some((public_key, signature)) = tx.signature_info() else {
            return Ok(());
        };
        let sig_hash = tx.sig_hash();
        if self.sig_cache.exists(&sig_hash, signature, public_key) {
            return Ok(());
        }
        let key_bytes: [u8; 32] = public_key
            .try_into()
            .map_err(|_| BlockchainError::InvalidTx("invalid public key length"))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| BlockchainError::InvalidTx("invalid public key"))?;
        let sig = Signature::from_slice(signature)
            .map_err(|_| BlockchainError::InvalidTx("malformed signature"))?;
        key.verify_strict(&sig_hash, &sig)
            .map_err(|_| BlockchainError::InvalidTx("invalid signature"))?;
        self.sig_cache.add(sig_hash, signature, public_key);
        Ok(())
    }
}
