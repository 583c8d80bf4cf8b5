//! Uniform random selection.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::strategy::{eligible, RotationStrategy, SelectionContext};

/// Picks uniformly among eligible proxies. Each instance owns a seeded PRNG
/// so selection sequences are reproducible in tests.
pub struct Random {
    rng: Mutex<StdRng>,
}

impl Random {
    pub const NAME: &'static str = "random";

    pub fn new() -> Self {
        Random {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Random {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationStrategy for Random {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy> {
        let candidates = eligible(view, ctx);
        if candidates.is_empty() {
            return Err(Error::NoProxiesAvailable);
        }
        let index = self.rng.lock().random_range(0..candidates.len());
        Ok(candidates[index].clone())
    }
}
