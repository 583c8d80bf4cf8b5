//! Sliding-window rate limiting keyed by hashed identifier and endpoint.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

pub use memory::InMemoryWindowStore;
#[cfg(feature = "redis-store")]
pub use redis::RedisWindowStore;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{Error, Result};

/// Who is being limited.
///
/// API keys are digested before use; client IPs are taken as-is. The
/// limiter never derives an identifier from forwarded-for headers; callers
/// must hand it the direct peer address.
#[derive(Clone, PartialEq, Eq)]
pub enum Identifier {
    ApiKey(String),
    ClientIp(IpAddr),
}

impl std::fmt::Debug for Identifier {
    /// Raw API keys stay out of logs; only the digest is printable.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::ApiKey(_) => write!(f, "ApiKey({})", self.storage_key()),
            Identifier::ClientIp(ip) => write!(f, "ClientIp({ip})"),
        }
    }
}

impl Identifier {
    /// Key component stored and logged in place of the raw value.
    pub fn storage_key(&self) -> String {
        match self {
            Identifier::ApiKey(key) => {
                let digest = Sha256::digest(key.as_bytes());
                let mut out = String::with_capacity(digest.len() * 2);
                for byte in digest {
                    out.push_str(&format!("{byte:02x}"));
                }
                out
            }
            Identifier::ClientIp(ip) => ip.to_string(),
        }
    }
}

/// One limit: at most `limit` events per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl LimitRule {
    pub fn new(limit: u32, window: Duration) -> Self {
        LimitRule { limit, window }
    }

    fn rate(&self) -> f64 {
        self.limit as f64 / self.window.as_secs_f64().max(f64::MIN_POSITIVE)
    }

    /// The lower requests-per-second rate wins; ties go to the lower limit.
    fn more_restrictive(self, other: LimitRule) -> LimitRule {
        let (a, b) = (self.rate(), other.rate());
        if (a - b).abs() < f64::EPSILON {
            if self.limit <= other.limit {
                self
            } else {
                other
            }
        } else if a < b {
            self
        } else {
            other
        }
    }
}

/// A named class of identifiers with a default rule and per-endpoint
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitTier {
    pub name: String,
    pub rule: LimitRule,
    #[serde(default)]
    pub per_endpoint_overrides: HashMap<String, LimitRule>,
}

impl RateLimitTier {
    pub fn new(name: impl Into<String>, limit: u32, window: Duration) -> Self {
        RateLimitTier {
            name: name.into(),
            rule: LimitRule::new(limit, window),
            per_endpoint_overrides: HashMap::new(),
        }
    }

    pub fn with_endpoint_override(
        mut self,
        endpoint: impl Into<String>,
        limit: u32,
        window: Duration,
    ) -> Self {
        self.per_endpoint_overrides
            .insert(endpoint.into(), LimitRule::new(limit, window));
        self
    }

    /// Effective rule for an endpoint: the most restrictive of the tier
    /// default and any override.
    pub fn effective(&self, endpoint: &str) -> LimitRule {
        match self.per_endpoint_overrides.get(endpoint) {
            Some(override_rule) => self.rule.more_restrictive(*override_rule),
            None => self.rule,
        }
    }
}

/// What to do when the backing store is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    FailOpen,
    #[default]
    FailClosed,
}

/// The limiter's verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        limit: u32,
        remaining: u32,
        resets_at_ms: u64,
    },
    Denied {
        limit: u32,
        retry_after: Duration,
        resets_at_ms: u64,
    },
    /// Whitelisted identifier; no counting, no headers.
    Bypassed,
}

impl Decision {
    /// Rate-limit headers for the handler layer. Empty for bypassed
    /// identifiers.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Decision::Allowed {
                limit,
                remaining,
                resets_at_ms,
            } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", remaining.to_string()),
                ("X-RateLimit-Reset", (resets_at_ms / 1000).to_string()),
            ],
            Decision::Denied {
                limit,
                retry_after,
                resets_at_ms,
            } => vec![
                ("X-RateLimit-Limit", limit.to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Reset", (resets_at_ms / 1000).to_string()),
                ("Retry-After", retry_after.as_secs().max(1).to_string()),
            ],
            Decision::Bypassed => Vec::new(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }
}

/// Store-level failure; mapped to `Error::StoreUnavailable` or swallowed
/// depending on the fail mode.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Result of one atomic window operation.
#[derive(Debug, Clone, Copy)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Events in the window before this request was appended.
    pub used: u32,
    /// Oldest event after the operation, if any remain.
    pub oldest_ms: Option<u64>,
}

/// Backing store executing the drop→count→append→expire sequence
/// atomically per key.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn check_and_append(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
        now_ms: u64,
    ) -> std::result::Result<WindowDecision, StoreError>;
}

/// Millisecond clock the limiter reasons in. Monotonic within a process;
/// tests drive time by hand.
pub trait LimiterClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock-anchored monotonic clock: absolute enough for a shared
/// store, immune to wall-clock jumps after construction.
pub struct MonotonicClock {
    anchor: Instant,
    epoch_ms: u64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        MonotonicClock {
            anchor: Instant::now(),
            epoch_ms,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LimiterClock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.anchor.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests.
pub struct ManualClock {
    now_ms: RwLock<u64>,
}

impl ManualClock {
    pub fn at(now_ms: u64) -> Self {
        ManualClock {
            now_ms: RwLock::new(now_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        *self.now_ms.write() += delta_ms;
    }

    pub fn set(&self, now_ms: u64) {
        *self.now_ms.write() = now_ms;
    }
}

impl LimiterClock for ManualClock {
    fn now_ms(&self) -> u64 {
        *self.now_ms.read()
    }
}

/// Sliding-window rate limiter over a pluggable store.
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    default_tier: RateLimitTier,
    tiers: RwLock<HashMap<String, RateLimitTier>>,
    assignments: RwLock<HashMap<String, String>>,
    whitelist: RwLock<HashSet<String>>,
    fail_mode: FailMode,
    clock: Arc<dyn LimiterClock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, default_tier: RateLimitTier) -> Self {
        RateLimiter {
            store,
            default_tier,
            tiers: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            whitelist: RwLock::new(HashSet::new()),
            fail_mode: FailMode::default(),
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn LimiterClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a named tier identifiers can be assigned to.
    pub fn add_tier(&self, tier: RateLimitTier) {
        self.tiers.write().insert(tier.name.clone(), tier);
    }

    /// Put an identifier into a named tier.
    pub fn assign_tier(&self, identifier: &Identifier, tier_name: impl Into<String>) {
        self.assignments
            .write()
            .insert(identifier.storage_key(), tier_name.into());
    }

    /// Exempt an identifier from all checks.
    pub fn whitelist(&self, identifier: &Identifier) {
        self.whitelist.write().insert(identifier.storage_key());
    }

    fn tier_for(&self, storage_key: &str) -> RateLimitTier {
        let assignments = self.assignments.read();
        if let Some(tier_name) = assignments.get(storage_key) {
            if let Some(tier) = self.tiers.read().get(tier_name) {
                return tier.clone();
            }
        }
        self.default_tier.clone()
    }

    /// Atomic check-and-increment for one `(identifier, endpoint)` pair.
    pub async fn check(&self, identifier: &Identifier, endpoint: &str) -> Result<Decision> {
        let storage_key = identifier.storage_key();
        if self.whitelist.read().contains(&storage_key) {
            return Ok(Decision::Bypassed);
        }

        let tier = self.tier_for(&storage_key);
        let rule = tier.effective(endpoint);
        let window_ms = rule.window.as_millis() as u64;
        let key = format!("ratelimit:{storage_key}:{endpoint}");
        let now_ms = self.clock.now_ms();

        match self
            .store
            .check_and_append(&key, rule.limit, window_ms, now_ms)
            .await
        {
            Ok(window) => {
                let oldest = window.oldest_ms.unwrap_or(now_ms);
                let resets_at_ms = oldest + window_ms;
                if window.allowed {
                    Ok(Decision::Allowed {
                        limit: rule.limit,
                        remaining: rule.limit.saturating_sub(window.used + 1),
                        resets_at_ms,
                    })
                } else {
                    Ok(Decision::Denied {
                        limit: rule.limit,
                        retry_after: Duration::from_millis(resets_at_ms.saturating_sub(now_ms)),
                        resets_at_ms,
                    })
                }
            }
            Err(e) => match self.fail_mode {
                FailMode::FailOpen => {
                    warn!("Rate limit store unavailable, failing open: {e}");
                    Ok(Decision::Allowed {
                        limit: rule.limit,
                        remaining: rule.limit.saturating_sub(1),
                        resets_at_ms: now_ms + window_ms,
                    })
                }
                FailMode::FailClosed => Err(Error::StoreUnavailable(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with_clock(limit: u32, window: Duration) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = RateLimiter::new(
            Arc::new(InMemoryWindowStore::new()),
            RateLimitTier::new("default", limit, window),
        )
        .with_clock(clock.clone());
        (limiter, clock)
    }

    #[test]
    fn api_keys_are_digested_ips_are_not() {
        let key = Identifier::ApiKey("sk-very-secret".into());
        let hashed = key.storage_key();
        assert_eq!(hashed.len(), 64);
        assert!(!hashed.contains("secret"));
        assert!(!format!("{key:?}").contains("secret"));

        let ip = Identifier::ClientIp("203.0.113.9".parse().unwrap());
        assert_eq!(ip.storage_key(), "203.0.113.9");
    }

    #[test]
    fn most_restrictive_rule_wins() {
        let tier = RateLimitTier::new("default", 100, Duration::from_secs(60))
            .with_endpoint_override("expensive", 5, Duration::from_secs(60))
            .with_endpoint_override("generous", 1000, Duration::from_secs(60));

        assert_eq!(tier.effective("expensive").limit, 5);
        // An override looser than the tier default does not loosen it.
        assert_eq!(tier.effective("generous").limit, 100);
        assert_eq!(tier.effective("other").limit, 100);
    }

    #[tokio::test]
    async fn the_window_slides() {
        let (limiter, clock) = limiter_with_clock(10, Duration::from_secs(60));
        let who = Identifier::ApiKey("caller".into());

        // t = 0..9 s: ten calls, all allowed.
        for t in 0..10u64 {
            clock.set(t * 1000);
            let decision = limiter.check(&who, "api").await.unwrap();
            assert!(decision.is_allowed(), "call at t={t} should pass");
        }

        // t = 10 s: denied, retry after ~50 s.
        clock.set(10_000);
        match limiter.check(&who, "api").await.unwrap() {
            Decision::Denied { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(50));
            }
            other => panic!("expected denial, got {other:?}"),
        }

        // t = 61 s: the oldest event fell out; allowed again.
        clock.set(61_000);
        assert!(limiter.check(&who, "api").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        let (limiter, _clock) = limiter_with_clock(3, Duration::from_secs(60));
        let who = Identifier::ApiKey("caller".into());

        for expected in [2u32, 1, 0] {
            match limiter.check(&who, "api").await.unwrap() {
                Decision::Allowed { remaining, .. } => assert_eq!(remaining, expected),
                other => panic!("expected allow, got {other:?}"),
            }
        }
        assert!(!limiter.check(&who, "api").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn endpoints_count_separately() {
        let (limiter, _clock) = limiter_with_clock(1, Duration::from_secs(60));
        let who = Identifier::ApiKey("caller".into());

        assert!(limiter.check(&who, "a").await.unwrap().is_allowed());
        assert!(limiter.check(&who, "b").await.unwrap().is_allowed());
        assert!(!limiter.check(&who, "a").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn whitelisted_identifiers_bypass_without_headers() {
        let (limiter, _clock) = limiter_with_clock(1, Duration::from_secs(60));
        let vip = Identifier::ApiKey("vip".into());
        limiter.whitelist(&vip);

        for _ in 0..10 {
            let decision = limiter.check(&vip, "api").await.unwrap();
            assert_eq!(decision, Decision::Bypassed);
            assert!(decision.headers().is_empty());
        }
    }

    #[tokio::test]
    async fn tier_assignment_changes_the_rule() {
        let (limiter, _clock) = limiter_with_clock(100, Duration::from_secs(60));
        limiter.add_tier(RateLimitTier::new("free", 1, Duration::from_secs(60)));
        let who = Identifier::ApiKey("cheapskate".into());
        limiter.assign_tier(&who, "free");

        assert!(limiter.check(&who, "api").await.unwrap().is_allowed());
        assert!(!limiter.check(&who, "api").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn headers_reflect_the_decision() {
        let (limiter, clock) = limiter_with_clock(5, Duration::from_secs(60));
        let who = Identifier::ApiKey("caller".into());

        clock.set(1_000);
        let decision = limiter.check(&who, "api").await.unwrap();
        let headers = decision.headers();
        assert!(headers.contains(&("X-RateLimit-Limit", "5".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "4".to_string())));
        assert!(headers.iter().any(|(name, _)| *name == "X-RateLimit-Reset"));
        assert!(!headers.iter().any(|(name, _)| *name == "Retry-After"));

        for _ in 0..4 {
            limiter.check(&who, "api").await.unwrap();
        }
        let denied = limiter.check(&who, "api").await.unwrap();
        assert!(denied
            .headers()
            .iter()
            .any(|(name, _)| *name == "Retry-After"));
    }

    struct BrokenStore;

    #[async_trait]
    impl WindowStore for BrokenStore {
        async fn check_and_append(
            &self,
            _key: &str,
            _limit: u32,
            _window_ms: u64,
            _now_ms: u64,
        ) -> std::result::Result<WindowDecision, StoreError> {
            Err(StoreError("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn fail_closed_surfaces_store_errors() {
        let limiter = RateLimiter::new(
            Arc::new(BrokenStore),
            RateLimitTier::new("default", 10, Duration::from_secs(60)),
        );
        let err = limiter
            .check(&Identifier::ApiKey("caller".into()), "api")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn fail_open_allows_with_a_warning() {
        let limiter = RateLimiter::new(
            Arc::new(BrokenStore),
            RateLimitTier::new("default", 10, Duration::from_secs(60)),
        )
        .with_fail_mode(FailMode::FailOpen);
        let decision = limiter
            .check(&Identifier::ApiKey("caller".into()), "api")
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }
}
