use log::debug;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::crypto::hash_sum;

/// Attempts between two progress log lines
const PROGRESS_INTERVAL: u64 = 1 << 20;

/// Externally triggered signal that aborts a nonce search.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a nonce search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mined {
    /// The nonce satisfies the target
    Found(u64),

    /// Search aborted; carries the nonce reached so far
    Cancelled(u64),

    /// Nonce space ran out without a solution
    Exhausted(u64),
}

impl Mined {
    pub fn nonce(&self) -> u64 {
        match *self {
            Mined::Found(n) | Mined::Cancelled(n) | Mined::Exhausted(n) => n,
        }
    }
}

/// Number of leading zero bits of a big-endian byte string
pub fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut total = 0u32;
    for b in hash {
        if *b == 0 {
            total += 8;
        } else {
            total += b.leading_zeros();
            break;
        }
    }
    total
}

/// `H(block_hash ‖ BE64(nonce))`
pub fn proof_hash(block_hash: &[u8], nonce: u64) -> Vec<u8> {
    hash_sum(&[block_hash, &nonce.to_be_bytes()[..]])
}

/// A 256-bit hash is below `2^(256 - difficulty)` exactly when it has at least
/// `difficulty` leading zero bits.
pub fn meets_target(hash: &[u8], difficulty: u8) -> bool {
    leading_zero_bits(hash) >= u32::from(difficulty)
}

pub fn proof_is_valid(block_hash: &[u8], nonce: u64, difficulty: u8) -> bool {
    meets_target(&proof_hash(block_hash, nonce), difficulty)
}

/// Searches nonces upward from `seed` until one meets the target.
///
/// `cancel` is polled before every attempt.
pub fn proof_of_work(block_hash: &[u8], difficulty: u8, seed: u64, cancel: &CancelToken) -> Mined {
    let mut nonce = seed;
    let mut attempts = 0u64;

    loop {
        if cancel.is_cancelled() {
            debug!("Mining cancelled at nonce {} after {} attempts", nonce, attempts);
            return Mined::Cancelled(nonce);
        }

        if proof_is_valid(block_hash, nonce, difficulty) {
            debug!("Mined nonce {} after {} attempts", nonce, attempts);
            return Mined::Found(nonce);
        }

        attempts += 1;
        if attempts % PROGRESS_INTERVAL == 0 {
            debug!("Mining: {} attempts, current nonce {}", attempts, nonce);
        }

        nonce = match nonce.checked_add(1) {
            Some(next) => next,
            None => return Mined::Exhausted(nonce),
        };
    }
}
