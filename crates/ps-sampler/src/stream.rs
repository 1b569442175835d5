//! Explicit pseudo-random stream threaded through a sweep.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Seeded random stream used for every distribution draw of one sweep.
///
/// Only the coordinating rank advances it; draws are shared with the other
/// ranks through the backend's broadcast.
#[derive(Debug, Clone)]
pub struct SampleStream {
    seed: u64,
    rng: ChaCha8Rng,
}

impl SampleStream {
    /// `None` picks a fresh entropy seed, making draws non-reproducible.
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random);
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(Some(seed))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub(crate) fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}
