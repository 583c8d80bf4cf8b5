//! Performance-based selection.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::proxy::{Proxy, ProxyId};
use crate::strategy::{eligible, Outcome, RotationStrategy, SelectionContext};

/// Tunables for [`PerformanceBased`]. Surfaced rather than hard-coded; no
/// canonical constants exist for this scoring.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceConfig {
    /// Reward for success rate.
    pub alpha: f64,
    /// Penalty for normalized latency.
    pub beta: f64,
    /// Penalty for recent failure pressure.
    pub gamma: f64,
    /// Latency normalization scale in milliseconds.
    pub latency_scale_ms: f64,
    /// Samples kept per proxy in the strategy's own rolling window.
    pub window: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            alpha: 1.0,
            beta: 0.5,
            gamma: 0.3,
            latency_scale_ms: 1000.0,
            window: 50,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    ok: bool,
    latency_ms: Option<u64>,
}

/// How many of the most recent samples feed the failure-pressure term.
const PRESSURE_SPAN: usize = 10;

/// Scores each proxy as `α·success_rate − β·normalized_latency −
/// γ·failure_pressure` and picks the arg-max, ties broken by view order.
///
/// Keeps its own bounded rolling window per proxy, separate from pool
/// stats, so a hot-swap discards only the strategy's history. Pool stats
/// serve as a cold-start signal for proxies the window has not seen yet.
pub struct PerformanceBased {
    config: PerformanceConfig,
    windows: Mutex<HashMap<ProxyId, VecDeque<Sample>>>,
}

impl PerformanceBased {
    pub const NAME: &'static str = "performance-based";

    pub fn new(config: PerformanceConfig) -> Self {
        PerformanceBased {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn score(&self, proxy: &Proxy, windows: &HashMap<ProxyId, VecDeque<Sample>>) -> f64 {
        let (success_rate, avg_latency, pressure) = match windows.get(&proxy.id) {
            Some(window) if !window.is_empty() => {
                let successes = window.iter().filter(|s| s.ok).count();
                let success_rate = successes as f64 / window.len() as f64;

                let latencies: Vec<u64> = window.iter().filter_map(|s| s.latency_ms).collect();
                let avg_latency = if latencies.is_empty() {
                    0.0
                } else {
                    latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
                };

                let span = window.len().min(PRESSURE_SPAN);
                let recent_failures = window
                    .iter()
                    .rev()
                    .take(span)
                    .filter(|s| !s.ok)
                    .count();
                let pressure = recent_failures as f64 / PRESSURE_SPAN as f64;

                (success_rate, avg_latency, pressure)
            }
            _ => {
                // Cold start: lean on pool stats.
                let pressure =
                    proxy.stats.consecutive_failures.min(PRESSURE_SPAN as u32) as f64
                        / PRESSURE_SPAN as f64;
                (
                    proxy.stats.success_rate(),
                    proxy.stats.latency_ewma_ms.unwrap_or(0.0),
                    pressure,
                )
            }
        };

        self.config.alpha * success_rate
            - self.config.beta * (avg_latency / self.config.latency_scale_ms)
            - self.config.gamma * pressure
    }
}

impl Default for PerformanceBased {
    fn default() -> Self {
        Self::new(PerformanceConfig::default())
    }
}

impl RotationStrategy for PerformanceBased {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy> {
        let candidates = eligible(view, ctx);
        if candidates.is_empty() {
            return Err(Error::NoProxiesAvailable);
        }

        let windows = self.windows.lock();
        let mut best = candidates[0];
        let mut best_score = self.score(best, &windows);
        for &candidate in &candidates[1..] {
            let score = self.score(candidate, &windows);
            // Strictly greater: earlier view positions win ties.
            if score > best_score {
                best = candidate;
                best_score = score;
            }
        }
        Ok(best.clone())
    }

    fn record_result(&self, proxy: &Proxy, outcome: &Outcome) {
        let mut windows = self.windows.lock();
        let window = windows.entry(proxy.id).or_default();
        window.push_back(Sample {
            ok: outcome.is_ok(),
            latency_ms: outcome.latency_ms(),
        });
        while window.len() > self.config.window {
            window.pop_front();
        }
    }
}
