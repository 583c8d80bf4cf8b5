//! Least-used selection by in-flight count.

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::strategy::{eligible, Outcome, RotationStrategy, SelectionContext};

/// Picks the proxy with the fewest in-flight requests; ties break on the
/// lower total request count, then on view order.
///
/// The only strategy that mutates a proxy cell during selection: it bumps
/// the chosen proxy's shared in-flight counter, and releases it when the
/// rotator records the outcome. The counter is an atomic shared between the
/// pool entry and every snapshot clone, so the accounting is global per
/// proxy.
pub struct LeastUsed;

impl LeastUsed {
    pub const NAME: &'static str = "least-used";

    pub fn new() -> Self {
        LeastUsed
    }
}

impl Default for LeastUsed {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationStrategy for LeastUsed {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy> {
        let candidates = eligible(view, ctx);
        let chosen = candidates
            .iter()
            .min_by_key(|p| (p.in_flight(), p.stats.total_requests))
            .ok_or(Error::NoProxiesAvailable)?;
        chosen.acquire_slot();
        Ok((*chosen).clone())
    }

    fn record_result(&self, proxy: &Proxy, _outcome: &Outcome) {
        proxy.release_slot();
    }
}
