//! Selection strategies: the trait, per-request context, and built-ins.
//!
//! A strategy picks one proxy from a snapshot view of the pool. Selection is
//! synchronous, never performs I/O, and never mutates the pool; strategies
//! keep whatever auxiliary state they need behind their own locks so the
//! rotator can hot-swap them without touching pool statistics.

mod composite;
mod geo;
mod least_used;
mod performance;
mod random;
mod registry;
mod round_robin;
mod session;
mod weighted;

pub use composite::{CompositeConfig, CompositeStrategy};
pub use geo::GeoTargeted;
pub use least_used::LeastUsed;
pub use performance::{PerformanceBased, PerformanceConfig};
pub use random::Random;
pub use registry::StrategyRegistry;
pub use round_robin::RoundRobin;
pub use session::SessionPersistence;
pub use weighted::{Weighted, WeightedConfig};

use std::collections::HashSet;

use crate::error::{ErrorKind, Result};
use crate::proxy::{Proxy, ProxyId};

/// Per-request inputs consumed by strategies.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// Stable token for sticky sessions.
    pub session_key: Option<String>,
    /// ISO-3166 alpha-2 country constraint.
    pub target_country: Option<String>,
    /// Coarse region constraint (e.g. `NA`, `EU`, `APAC`).
    pub target_region: Option<String>,
    /// Proxies already tried for this request; selection must skip them.
    pub failed_proxy_ids: HashSet<ProxyId>,
    /// Zero-based retry counter.
    pub attempt: u32,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn with_target_country(mut self, country: impl Into<String>) -> Self {
        self.target_country = Some(country.into());
        self
    }

    pub fn with_target_region(mut self, region: impl Into<String>) -> Self {
        self.target_region = Some(region.into());
        self
    }

    pub fn mark_failed(&mut self, id: ProxyId) {
        self.failed_proxy_ids.insert(id);
    }

    pub fn is_failed(&self, id: ProxyId) -> bool {
        self.failed_proxy_ids.contains(&id)
    }
}

/// The record a rotator feeds back after a forward attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Ok { latency_ms: u64 },
    Fail { error_kind: ErrorKind },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            Outcome::Ok { latency_ms } => Some(*latency_ms),
            Outcome::Fail { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Ok { .. } => None,
            Outcome::Fail { error_kind } => Some(*error_kind),
        }
    }
}

/// A proxy selection strategy.
pub trait RotationStrategy: Send + Sync {
    /// Canonical name, matching the registry key for built-ins.
    fn name(&self) -> &'static str;

    /// Pick one proxy from the view, excluding `ctx.failed_proxy_ids`.
    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy>;

    /// Observe the outcome of a request through `proxy`. Default: ignore.
    fn record_result(&self, _proxy: &Proxy, _outcome: &Outcome) {}
}

/// A strategy's select logic reinterpreted as a predicate over the view.
/// Filters narrow, selectors pick; `GeoTargeted` implements both.
pub trait ViewFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn filter(&self, view: &[Proxy], ctx: &SelectionContext) -> Vec<Proxy>;
}

impl std::fmt::Debug for dyn RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationStrategy")
            .field("name", &self.name())
            .finish()
    }
}

impl std::fmt::Debug for dyn ViewFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewFilter")
            .field("name", &self.name())
            .finish()
    }
}

/// View entries not yet failed for this request, original order kept.
pub(crate) fn eligible<'a>(view: &'a [Proxy], ctx: &SelectionContext) -> Vec<&'a Proxy> {
    view.iter().filter(|p| !ctx.is_failed(p.id)).collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::proxy::{Proxy, ProxyEndpoint, ProxyScheme};

    /// Test pool entry on a distinct `(host, port)` per index.
    pub fn make_proxy(index: u16) -> Proxy {
        Proxy::new(ProxyEndpoint::new(
            ProxyScheme::Http,
            format!("10.0.0.{}", index),
            8000 + index,
        ))
    }

    pub fn make_view(count: u16) -> Vec<Proxy> {
        (0..count).map(make_proxy).collect()
    }
}
