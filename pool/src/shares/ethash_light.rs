//! Ethash light verification.
//!
//! Shares are checked with `hashimoto_light` against the per-epoch cache, so
//! the pool never builds a DAG. Caches for the most recent epochs are kept.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::pow::{decode_hash, target_from_difficulty, Candidate, PowVerifier};

pub const EPOCH_LENGTH: u64 = 30_000;
const CACHED_EPOCHS: usize = 3;

pub fn epoch_of(number: u64) -> u64 {
    number / EPOCH_LENGTH
}

struct LightCache {
    epoch: u64,
    full_size: usize,
    cache: Vec<u8>,
}

impl LightCache {
    fn generate(epoch: u64) -> Self {
        let started = Instant::now();
        let e = epoch as usize;
        let mut cache = vec![0u8; ethash::get_cache_size(e)];
        ethash::make_cache(&mut cache, ethash::get_seedhash(e));
        tracing::info!(
            "Ethash cache for epoch {} ready ({} bytes) in {:?}",
            epoch,
            cache.len(),
            started.elapsed()
        );
        Self {
            epoch,
            full_size: ethash::get_full_size(e),
            cache,
        }
    }

    /// `(mix digest, result)` for a header hash and a big-endian nonce.
    fn hashimoto(&self, header: [u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]) {
        let (mix, result) = ethash::hashimoto_light(
            header.into(),
            nonce.to_be_bytes().into(),
            self.full_size,
            &self.cache,
        );
        (mix.0, result.0)
    }
}

#[derive(Default)]
pub struct EthashVerifier {
    caches: Mutex<VecDeque<Arc<LightCache>>>,
}

impl EthashVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache for the epoch of `number` ahead of the first share.
    pub fn prepare(&self, number: u64) {
        self.cache_for(number);
    }

    fn caches(&self) -> MutexGuard<'_, VecDeque<Arc<LightCache>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_for(&self, number: u64) -> Arc<LightCache> {
        let epoch = epoch_of(number);
        if let Some(hit) = self.caches().iter().find(|c| c.epoch == epoch) {
            return hit.clone();
        }

        // Generated outside the lock; a concurrent duplicate is dropped below.
        let fresh = Arc::new(LightCache::generate(epoch));
        let mut caches = self.caches();
        if let Some(hit) = caches.iter().find(|c| c.epoch == epoch) {
            return hit.clone();
        }
        if caches.len() >= CACHED_EPOCHS {
            caches.pop_front();
        }
        caches.push_back(fresh.clone());
        fresh
    }
}

impl PowVerifier for EthashVerifier {
    fn verify(&self, candidate: &Candidate) -> bool {
        let (Some(header), Some(mix)) = (
            decode_hash(&candidate.header_hash),
            decode_hash(&candidate.mix_digest),
        ) else {
            return false;
        };
        if candidate.difficulty == 0 {
            return false;
        }

        let (expected_mix, result) = self.cache_for(candidate.number).hashimoto(header, candidate.nonce);
        mix == expected_mix && result <= target_from_difficulty(candidate.difficulty)
    }

    fn mix_digest(&self, number: u64, header_hash: &str, nonce: u64) -> Option<String> {
        let header = decode_hash(header_hash)?;
        let (mix, _) = self.cache_for(number).hashimoto(header, nonce);
        Some(format!("0x{}", hex::encode(mix)))
    }
}
