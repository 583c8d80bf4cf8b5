//! Core proxy pool implementation.

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::proxy::{HealthState, Proxy, ProxyId};
use crate::store::{PoolSnapshot, ProxyRecord};
use crate::strategy::Outcome;

/// Aggregate counts per health state, for health endpoints and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub total: usize,
    pub unknown: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

/// A thread-safe pool of proxies.
///
/// Membership lives in an insertion-ordered `Vec` under a `RwLock`; reads
/// take clone snapshots, writes serialize through the lock. The pool is the
/// sole owner of each proxy's mutable cell: all stat updates go through
/// [`ProxyPool::update_stats`] or [`ProxyPool::apply_probe`].
pub struct ProxyPool {
    proxies: RwLock<Vec<Proxy>>,
    max_size: Option<usize>,
    default_max_rps: Mutex<Option<f64>>,
}

impl ProxyPool {
    pub fn new() -> Self {
        ProxyPool {
            proxies: RwLock::new(Vec::new()),
            max_size: None,
            default_max_rps: Mutex::new(None),
        }
    }

    /// Cap membership; exceeding the cap makes `add` fail with `PoolFull`.
    pub fn with_max_size(max_size: usize) -> Self {
        ProxyPool {
            proxies: RwLock::new(Vec::new()),
            max_size: Some(max_size),
            default_max_rps: Mutex::new(None),
        }
    }

    /// Default per-proxy requests-per-second cap. Applies to every proxy
    /// added from now on and retrofits current members; a proxy carrying
    /// its own cap keeps it.
    pub fn set_default_max_rps(&self, max_rps: Option<f64>) {
        *self.default_max_rps.lock() = max_rps;
        if let Some(rps) = max_rps {
            let mut proxies = self.proxies.write();
            for proxy in proxies.iter_mut().filter(|p| !p.has_throttle()) {
                proxy.install_throttle(rps);
            }
        }
    }

    /// Add a proxy. `(host, port)` must be unique within the pool; the
    /// entry starts out `unknown` regardless of what the caller set.
    pub fn add(&self, mut proxy: Proxy) -> Result<ProxyId> {
        let default_rps = *self.default_max_rps.lock();
        let mut proxies = self.proxies.write();

        if let Some(max) = self.max_size {
            if proxies.len() >= max {
                return Err(Error::PoolFull(max));
            }
        }
        if proxies
            .iter()
            .any(|p| p.endpoint.host == proxy.endpoint.host && p.endpoint.port == proxy.endpoint.port)
        {
            return Err(Error::DuplicateProxy {
                host: proxy.endpoint.host.clone(),
                port: proxy.endpoint.port,
            });
        }

        proxy.health = HealthState::Unknown;
        if !proxy.has_throttle() {
            if let Some(rps) = default_rps {
                proxy.install_throttle(rps);
            }
        }
        let id = proxy.id;
        info!("Adding proxy {} ({})", proxy.endpoint, proxy.source);
        proxies.push(proxy);
        Ok(id)
    }

    /// Remove by id, returning the evicted entry.
    pub fn remove(&self, id: ProxyId) -> Result<Proxy> {
        let mut proxies = self.proxies.write();
        let index = proxies
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::ProxyNotFound(id.to_string()))?;
        Ok(proxies.remove(index))
    }

    /// Remove by `(host, port)`. Identified this way so callers holding a
    /// stale snapshot can still evict the right entry.
    pub fn remove_by_endpoint(&self, host: &str, port: u16) -> Result<Proxy> {
        let mut proxies = self.proxies.write();
        let index = proxies
            .iter()
            .position(|p| p.endpoint.host == host && p.endpoint.port == port)
            .ok_or_else(|| Error::ProxyNotFound(format!("{host}:{port}")))?;
        Ok(proxies.remove(index))
    }

    pub fn get(&self, id: ProxyId) -> Option<Proxy> {
        self.proxies.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn contains_endpoint(&self, host: &str, port: u16) -> bool {
        self.proxies
            .read()
            .iter()
            .any(|p| p.endpoint.host == host && p.endpoint.port == port)
    }

    /// Snapshot of the entire membership, insertion order.
    pub fn list(&self) -> Vec<Proxy> {
        self.proxies.read().clone()
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }

    /// Snapshot of the currently eligible proxies: selectable health
    /// (unknown, healthy, degraded) and unexpired, in insertion order.
    /// Strategies rely on this ordering for round-robin reproducibility.
    pub fn healthy_view(&self, now: DateTime<Utc>) -> Vec<Proxy> {
        self.proxies
            .read()
            .iter()
            .filter(|p| p.health.is_selectable() && !p.is_expired(now))
            .cloned()
            .collect()
    }

    /// Drop proxies past their TTL. Returns how many were removed.
    pub fn remove_expired(&self, now: DateTime<Utc>) -> usize {
        let mut proxies = self.proxies.write();
        let before = proxies.len();
        proxies.retain(|p| !p.is_expired(now));
        let removed = before - proxies.len();
        if removed > 0 {
            info!("Removed {} expired proxies from pool", removed);
        }
        removed
    }

    /// Count a dispatch through `id`. Success/failure lands later via
    /// `update_stats`, so `successful + failed <= total` holds with a
    /// transient gap while the request is in flight.
    pub fn record_dispatch(&self, id: ProxyId) {
        let mut proxies = self.proxies.write();
        if let Some(proxy) = proxies.iter_mut().find(|p| p.id == id) {
            proxy.stats.total_requests += 1;
        }
    }

    /// Record a request outcome on the proxy's cell: counters, EWMA and the
    /// health transition, all under the write lock so two concurrent
    /// updates never lose a recorded outcome. Returns the updated snapshot,
    /// or `None` when the proxy has left the pool in the meantime.
    pub fn update_stats(&self, id: ProxyId, outcome: &Outcome) -> Option<Proxy> {
        let now = Utc::now();
        let mut proxies = self.proxies.write();
        let proxy = proxies.iter_mut().find(|p| p.id == id)?;

        let before = proxy.health;
        proxy.apply_outcome(outcome, now);
        if before != proxy.health {
            info!(
                "Proxy {} health changed: {:?} -> {:?}",
                proxy.endpoint, before, proxy.health
            );
        }
        Some(proxy.clone())
    }

    /// Apply a background probe result. Probes move health and the
    /// consecutive counters but do not inflate request totals, which count
    /// forwarded traffic only.
    pub fn apply_probe(
        &self,
        id: ProxyId,
        ok: bool,
        latency_ms: Option<u64>,
        kind: Option<ErrorKind>,
    ) -> Option<Proxy> {
        let now = Utc::now();
        let mut proxies = self.proxies.write();
        let proxy = proxies.iter_mut().find(|p| p.id == id)?;

        let before = proxy.health;
        if ok {
            proxy.stats.consecutive_failures = 0;
            proxy.stats.consecutive_successes += 1;
            proxy.stats.last_success_at = Some(now);
            if let Some(latency) = latency_ms {
                proxy.stats.observe_latency(latency);
            }
            proxy.health = proxy.health.on_success();
        } else {
            proxy.stats.consecutive_failures += 1;
            proxy.stats.consecutive_successes = 0;
            proxy.stats.last_failure_at = Some(now);
            if kind.is_some() {
                proxy.stats.last_error_kind = kind;
            }
            proxy.health = proxy.health.on_failure();
        }
        if before != proxy.health {
            info!(
                "Proxy {} health changed: {:?} -> {:?} (probe)",
                proxy.endpoint, before, proxy.health
            );
        }
        Some(proxy.clone())
    }

    /// Force a health state, e.g. `dead` just before eviction.
    pub fn set_health(&self, id: ProxyId, health: HealthState) -> Option<Proxy> {
        let mut proxies = self.proxies.write();
        let proxy = proxies.iter_mut().find(|p| p.id == id)?;
        proxy.health = health;
        Some(proxy.clone())
    }

    pub fn summary(&self) -> PoolSummary {
        let proxies = self.proxies.read();
        let mut summary = PoolSummary {
            total: proxies.len(),
            ..PoolSummary::default()
        };
        for proxy in proxies.iter() {
            match proxy.health {
                HealthState::Unknown => summary.unknown += 1,
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unhealthy | HealthState::Dead => summary.unhealthy += 1,
            }
        }
        summary
    }

    /// Storage-facing snapshot of the whole pool. This is the explicit
    /// reveal boundary for credentials; see `ProxyRecord::from_proxy`.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            taken_at: Utc::now(),
            proxies: self
                .proxies
                .read()
                .iter()
                .map(ProxyRecord::from_proxy)
                .collect(),
        }
    }

    /// Rebuild a pool from a snapshot, preserving identity, health and
    /// stats. Duplicate `(host, port)` entries in the snapshot are skipped
    /// with a warning rather than failing the whole restore.
    pub fn restore(snapshot: PoolSnapshot, max_size: Option<usize>) -> Self {
        let pool = ProxyPool {
            proxies: RwLock::new(Vec::new()),
            max_size,
            default_max_rps: Mutex::new(None),
        };
        {
            let mut proxies = pool.proxies.write();
            for record in snapshot.proxies {
                let proxy = record.into_proxy();
                if proxies
                    .iter()
                    .any(|p| p.endpoint.host == proxy.endpoint.host && p.endpoint.port == proxy.endpoint.port)
                {
                    warn!("Skipping duplicate {} while restoring pool", proxy.endpoint);
                    continue;
                }
                if let Some(max) = max_size {
                    if proxies.len() >= max {
                        warn!("Pool restore truncated at {} proxies", max);
                        break;
                    }
                }
                proxies.push(proxy);
            }
        }
        pool
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new()
    }
}
