//! Weighted selection by success rate and latency.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::strategy::{eligible, RotationStrategy, SelectionContext};

/// Tunables for [`Weighted`]. No canonical values exist; these defaults are
/// deliberately conservative.
#[derive(Debug, Clone, Copy)]
pub struct WeightedConfig {
    /// Latency time constant in the exponential decay term.
    pub tau_ms: f64,
    /// Weight floor so cold or slow proxies still get occasional traffic.
    pub min_weight: f64,
}

impl Default for WeightedConfig {
    fn default() -> Self {
        WeightedConfig {
            tau_ms: 250.0,
            min_weight: 0.05,
        }
    }
}

/// Draws proxies with probability proportional to
/// `clamp(success_rate · e^(-latency_ewma/τ), ε, 1)`.
pub struct Weighted {
    config: WeightedConfig,
    rng: Mutex<StdRng>,
}

impl Weighted {
    pub const NAME: &'static str = "weighted";

    pub fn new(config: WeightedConfig) -> Self {
        Weighted {
            config,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(config: WeightedConfig, seed: u64) -> Self {
        Weighted {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn weight(&self, proxy: &Proxy) -> f64 {
        let latency = proxy.stats.latency_ewma_ms.unwrap_or(0.0);
        let raw = proxy.stats.success_rate() * (-latency / self.config.tau_ms).exp();
        raw.clamp(self.config.min_weight, 1.0)
    }
}

impl Default for Weighted {
    fn default() -> Self {
        Self::new(WeightedConfig::default())
    }
}

impl RotationStrategy for Weighted {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy> {
        let candidates = eligible(view, ctx);
        if candidates.is_empty() {
            return Err(Error::NoProxiesAvailable);
        }

        let weights: Vec<f64> = candidates.iter().map(|p| self.weight(p)).collect();
        let total: f64 = weights.iter().sum();

        let mut point = self.rng.lock().random_range(0.0..total);
        for (candidate, weight) in candidates.iter().zip(weights.iter()) {
            if point < *weight {
                return Ok((*candidate).clone());
            }
            point -= weight;
        }
        // Floating-point slack can walk past the last bucket.
        Ok(candidates[candidates.len() - 1].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testutil::{make_proxy, make_view};
    use crate::strategy::Outcome;

    fn proxy_with_history(index: u16, successes: u64, failures: u64, latency: u64) -> Proxy {
        let mut proxy = make_proxy(index);
        proxy.stats.successful_requests = successes;
        proxy.stats.failed_requests = failures;
        proxy.stats.total_requests = successes + failures;
        proxy.stats.latency_ewma_ms = Some(latency as f64);
        proxy
    }

    #[test]
    fn reliable_fast_proxy_dominates() {
        let good = proxy_with_history(0, 95, 5, 50);
        let bad = proxy_with_history(1, 20, 80, 900);
        let view = vec![good.clone(), bad.clone()];

        let strategy = Weighted::with_seed(WeightedConfig::default(), 3);
        let ctx = SelectionContext::new();

        let mut good_picks = 0;
        for _ in 0..1000 {
            if strategy.select(&view, &ctx).unwrap().id == good.id {
                good_picks += 1;
            }
        }
        assert!(good_picks > 700, "good proxy picked only {good_picks}/1000");
    }

    #[test]
    fn cold_proxies_keep_the_floor_weight() {
        // All-new pool: every weight clamps to the floor, draw stays uniform
        // enough that each proxy is seen at least once.
        let view = make_view(4);
        let strategy = Weighted::with_seed(WeightedConfig::default(), 9);
        let ctx = SelectionContext::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(strategy.select(&view, &ctx).unwrap().id);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn skips_failed_proxies() {
        let view = make_view(2);
        let strategy = Weighted::with_seed(WeightedConfig::default(), 5);

        let mut ctx = SelectionContext::new();
        ctx.mark_failed(view[0].id);
        for _ in 0..20 {
            assert_eq!(strategy.select(&view, &ctx).unwrap().id, view[1].id);
        }

        ctx.mark_failed(view[1].id);
        assert!(matches!(
            strategy.select(&view, &ctx),
            Err(Error::NoProxiesAvailable)
        ));
    }

    #[test]
    fn record_result_is_a_noop() {
        // Weighted reads pool stats; it keeps no state of its own.
        let strategy = Weighted::default();
        let proxy = make_proxy(0);
        strategy.record_result(&proxy, &Outcome::Ok { latency_ms: 10 });
    }
}
