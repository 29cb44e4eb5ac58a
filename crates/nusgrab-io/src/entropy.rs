//! Entropy side-channel fed with I/O and transfer timing jitter.
//!
//! The surrounding application seeds its RNG from whatever lands here. It
//! is a side effect the pipeline preserves, not something it depends on.

use std::sync::Mutex;

/// Accepts small byte/timestamp samples.
pub trait EntropySink: Send + Sync {
    fn feed(&self, sample: &[u8]);
}

/// Discards every sample.
#[derive(Debug, Default)]
pub struct NoopEntropy;

impl EntropySink for NoopEntropy {
    fn feed(&self, _sample: &[u8]) {}
}

/// XOR-folds samples into a fixed pool the embedder can snapshot.
#[derive(Debug, Default)]
pub struct EntropyPool {
    state: Mutex<Pool>,
}

#[derive(Debug, Default)]
struct Pool {
    bytes: [u8; 32],
    cursor: usize,
}

impl EntropyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> [u8; 32] {
        match self.state.lock() {
            Ok(pool) => pool.bytes,
            Err(poisoned) => poisoned.into_inner().bytes,
        }
    }
}

impl EntropySink for EntropyPool {
    fn feed(&self, sample: &[u8]) {
        let mut pool = match self.state.lock() {
            Ok(pool) => pool,
            Err(poisoned) => poisoned.into_inner(),
        };
        for byte in sample {
            let cursor = pool.cursor;
            pool.bytes[cursor] ^= *byte;
            pool.cursor = (cursor + 1) % 32;
        }
    }
}
