//! Proxy representation: identity, health state machine, and statistics.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::secret::Secret;
use crate::strategy::Outcome;

/// Per-proxy direct rate limiter, capping requests per second.
pub(crate) type Throttle = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Smoothing factor for the latency EWMA.
const EWMA_ALPHA: f64 = 0.3;

/// Opaque unique identifier of a proxy within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyId(Uuid);

impl ProxyId {
    pub fn new() -> Self {
        ProxyId(Uuid::new_v4())
    }
}

impl Default for ProxyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire scheme spoken to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks5 => "socks5",
        }
    }

    /// SOCKS schemes get their own client family; see the transport module.
    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyScheme::Socks4 | ProxyScheme::Socks5)
    }
}

impl FromStr for ProxyScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            "socks4" => Ok(ProxyScheme::Socks4),
            "socks5" => Ok(ProxyScheme::Socks5),
            other => Err(Error::InvalidProxyFormat(format!(
                "unsupported scheme {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network identity of a proxy. `(host, port)` is the pool's dedup key;
/// scheme and credentials are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        ProxyEndpoint {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse `scheme://host:port` or bare `host:port` (defaults to http).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidProxyFormat("empty endpoint".into()));
        }

        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme.parse::<ProxyScheme>()?, rest),
            None => (ProxyScheme::Http, s),
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidProxyFormat(format!("missing port in {rest:?}")))?;
        if host.is_empty() {
            return Err(Error::InvalidProxyFormat(format!("missing host in {rest:?}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidProxyFormat(format!("bad port in {rest:?}")))?;

        Ok(ProxyEndpoint::new(scheme, host, port))
    }

    /// URL form without credentials, safe for logs.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Proxy authentication pair. The password never renders or serializes
/// in plaintext.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: Secret,
}

impl ProxyCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        ProxyCredentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &self.password)
            .finish()
    }
}

/// Where a proxy came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    /// Added through the user-facing API.
    User,
    /// Ingested from a named fetch source.
    Fetched(String),
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTag::User => f.write_str("user"),
            SourceTag::Fetched(name) => write!(f, "fetched:{name}"),
        }
    }
}

/// Health of a proxy.
///
/// `dead` is terminal within a pool membership; re-entry requires a fresh
/// add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not probed yet; eligible for traffic so it can be evaluated.
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Dead,
}

impl HealthState {
    /// Whether a proxy in this state may be returned by selection.
    pub fn is_selectable(self) -> bool {
        matches!(
            self,
            HealthState::Unknown | HealthState::Healthy | HealthState::Degraded
        )
    }

    pub fn on_success(self) -> Self {
        match self {
            HealthState::Unknown | HealthState::Healthy | HealthState::Degraded => {
                HealthState::Healthy
            }
            HealthState::Unhealthy => HealthState::Degraded,
            HealthState::Dead => HealthState::Dead,
        }
    }

    pub fn on_failure(self) -> Self {
        match self {
            HealthState::Unknown => HealthState::Unhealthy,
            HealthState::Healthy => HealthState::Degraded,
            HealthState::Degraded | HealthState::Unhealthy => HealthState::Unhealthy,
            HealthState::Dead => HealthState::Dead,
        }
    }

    /// Request-path failures soften health but never push a proxy out of
    /// the selectable set; only probe results (the monitor's job) drive it
    /// to unhealthy, and eviction stays distinct from failover.
    pub fn on_request_failure(self) -> Self {
        match self {
            HealthState::Healthy => HealthState::Degraded,
            other => other,
        }
    }
}

/// Mutable statistics cell of a proxy. Guarded by the pool lock; see
/// `ProxyPool::update_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub latency_ewma_ms: Option<f64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error_kind: Option<ErrorKind>,
}

impl ProxyStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_requests + self.failed_requests;
        if total == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / total as f64
    }

    pub(crate) fn observe_latency(&mut self, latency_ms: u64) {
        let sample = latency_ms as f64;
        self.latency_ewma_ms = Some(match self.latency_ewma_ms {
            None => sample,
            Some(prev) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * prev,
        });
    }

    pub(crate) fn record_success(&mut self, latency_ms: u64, now: DateTime<Utc>) {
        self.successful_requests += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.observe_latency(latency_ms);
        self.last_success_at = Some(now);
    }

    pub(crate) fn record_failure(&mut self, kind: ErrorKind, now: DateTime<Utc>) {
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_failure_at = Some(now);
        self.last_error_kind = Some(kind);
    }
}

/// A proxy server in the pool: immutable identity plus mutable health and
/// stats. Clones share the in-flight counter and throttle, so a snapshot
/// handed to a strategy still feeds least-used accounting.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub id: ProxyId,
    pub endpoint: ProxyEndpoint,
    pub credentials: Option<ProxyCredentials>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub source: SourceTag,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: Option<u64>,
    pub health: HealthState,
    pub stats: ProxyStats,
    in_flight: Arc<AtomicU32>,
    throttle: Option<Arc<Throttle>>,
}

impl Proxy {
    pub fn new(endpoint: ProxyEndpoint) -> Self {
        Proxy {
            id: ProxyId::new(),
            endpoint,
            credentials: None,
            country_code: None,
            region: None,
            source: SourceTag::User,
            created_at: Utc::now(),
            ttl_seconds: None,
            health: HealthState::Unknown,
            stats: ProxyStats::default(),
            in_flight: Arc::new(AtomicU32::new(0)),
            throttle: None,
        }
    }

    pub fn with_credentials(mut self, credentials: ProxyCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_country(mut self, code: impl Into<String>) -> Self {
        self.country_code = Some(code.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_source(mut self, source: SourceTag) -> Self {
        self.source = source;
        self
    }

    pub fn with_ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    /// Cap requests per second through this proxy.
    pub fn with_max_rps(mut self, max_rps: f64) -> Self {
        self.install_throttle(max_rps);
        self
    }

    pub(crate) fn install_throttle(&mut self, max_rps: f64) {
        let per_second = NonZeroU32::new(max_rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);
        self.throttle = Some(Arc::new(RateLimiter::direct(Quota::per_second(per_second))));
    }

    pub(crate) fn has_throttle(&self) -> bool {
        self.throttle.is_some()
    }

    pub(crate) fn throttle(&self) -> Option<&Arc<Throttle>> {
        self.throttle.as_ref()
    }

    /// Expiry instant derived from creation time and TTL; `None` means the
    /// proxy never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl_seconds
            .map(|ttl| self.created_at + ChronoDuration::seconds(ttl.min(i64::MAX as u64) as i64))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at(), Some(expiry) if expiry <= now)
    }

    /// Number of requests currently dispatched through this proxy.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn acquire_slot(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release_slot(&self) {
        // Saturating: a strategy swap mid-request may release without a
        // matching acquire on the new strategy's books.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub(crate) fn apply_outcome(&mut self, outcome: &Outcome, now: DateTime<Utc>) {
        match outcome {
            Outcome::Ok { latency_ms } => {
                self.stats.record_success(*latency_ms, now);
                self.health = self.health.on_success();
            }
            Outcome::Fail { error_kind } => {
                self.stats.record_failure(*error_kind, now);
                self.health = self.health.on_request_failure();
            }
        }
    }

    /// Convert to a `reqwest::Proxy`, wiring credentials when present.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy> {
        let mut proxy = reqwest::Proxy::all(self.endpoint.base_url())
            .map_err(|_| Error::InvalidProxyFormat(self.endpoint.base_url()))?;
        if let Some(creds) = &self.credentials {
            proxy = proxy.basic_auth(&creds.username, creds.password.reveal());
        }
        Ok(proxy)
    }
}
