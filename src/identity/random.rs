//! Shared randomness source
//!
//! One seeded generator per application instance, handed explicitly to every
//! component that needs jitter, offsets, shuffles or fresh identities.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Cloneable handle to a single pseudo-random generator.
///
/// Not cryptographically secured: identities and backoff jitter are public
/// values, not secrets.
#[derive(Clone, Debug)]
pub struct RandomnessSource {
    rng: Arc<Mutex<StdRng>>,
}

impl RandomnessSource {
    /// Seed from operating-system entropy
    pub fn from_entropy() -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Deterministic source for tests and simulations
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Uniform integer in `range` (inclusive on both ends)
    pub fn uniform(&self, range: RangeInclusive<u64>) -> u64 {
        self.rng.lock().gen_range(range)
    }

    /// Uniform index in `0..len`; `len` must be non-zero
    pub fn index(&self, len: usize) -> usize {
        self.rng.lock().gen_range(0..len)
    }

    /// Shuffle a slice in place
    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.rng.lock());
    }
}

impl Default for RandomnessSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}
