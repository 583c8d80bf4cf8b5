//! Session-sticky selection.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::proxy::{Proxy, ProxyId};
use crate::strategy::{eligible, Outcome, RotationStrategy, RoundRobin, SelectionContext};

const DEFAULT_SESSIONS: usize = 1024;

/// Maps `session_key` to a stable proxy for the lifetime of the session.
///
/// The mapping lives in a bounded LRU. While the mapped proxy stays in the
/// view (and is not failed for this request), every call with the same key
/// returns it; once it drops out, the key deterministically rehashes onto
/// the eligible view and sticks to the new proxy. Requests without a
/// session key fall through to an inner strategy.
pub struct SessionPersistence {
    sessions: Mutex<LruCache<String, ProxyId>>,
    fallback: Arc<dyn RotationStrategy>,
}

impl SessionPersistence {
    pub const NAME: &'static str = "session";

    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SESSIONS)
    }

    pub fn with_capacity(max_sessions: usize) -> Self {
        SessionPersistence {
            sessions: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_sessions.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
            fallback: Arc::new(RoundRobin::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn RotationStrategy>) -> Self {
        self.fallback = fallback;
        self
    }

    fn bucket(key: &str, len: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % len as u64) as usize
    }
}

impl Default for SessionPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationStrategy for SessionPersistence {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(&self, view: &[Proxy], ctx: &SelectionContext) -> Result<Proxy> {
        let key = match &ctx.session_key {
            Some(key) => key,
            None => return self.fallback.select(view, ctx),
        };

        let candidates = eligible(view, ctx);
        if candidates.is_empty() {
            return Err(Error::NoProxiesAvailable);
        }

        let mut sessions = self.sessions.lock();
        if let Some(mapped) = sessions.get(key) {
            if let Some(proxy) = candidates.iter().find(|p| p.id == *mapped) {
                return Ok((*proxy).clone());
            }
            // Mapped proxy became unhealthy, expired or failed: remap below.
        }

        let chosen = candidates[Self::bucket(key, candidates.len())];
        sessions.put(key.clone(), chosen.id);
        Ok(chosen.clone())
    }

    fn record_result(&self, proxy: &Proxy, outcome: &Outcome) {
        self.fallback.record_result(proxy, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::HealthState;
    use crate::strategy::testutil::make_view;

    #[test]
    fn same_key_sticks_to_one_proxy() {
        let view = make_view(5);
        let strategy = SessionPersistence::new();
        let ctx = SelectionContext::new().with_session_key("user-42");

        let first = strategy.select(&view, &ctx).unwrap();
        for _ in 0..20 {
            assert_eq!(strategy.select(&view, &ctx).unwrap().id, first.id);
        }
    }

    #[test]
    fn different_keys_may_spread() {
        let view = make_view(8);
        let strategy = SessionPersistence::new();

        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            let ctx = SelectionContext::new().with_session_key(format!("user-{i}"));
            seen.insert(strategy.select(&view, &ctx).unwrap().id);
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn remaps_when_the_mapped_proxy_disappears_and_stays_sticky() {
        let mut view = make_view(4);
        let strategy = SessionPersistence::new();
        let ctx = SelectionContext::new().with_session_key("user-42");

        let original = strategy.select(&view, &ctx).unwrap();

        // The mapped proxy drops out of the healthy view.
        view.retain(|p| p.id != original.id);
        for p in &mut view {
            p.health = HealthState::Healthy;
        }

        let remapped = strategy.select(&view, &ctx).unwrap();
        assert_ne!(remapped.id, original.id);
        for _ in 0..20 {
            assert_eq!(strategy.select(&view, &ctx).unwrap().id, remapped.id);
        }
    }

    #[test]
    fn no_session_key_uses_the_fallback() {
        let view = make_view(3);
        let strategy = SessionPersistence::new();
        let ctx = SelectionContext::new();

        // Round-robin fallback cycles instead of sticking.
        let a = strategy.select(&view, &ctx).unwrap();
        let b = strategy.select(&view, &ctx).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn bounded_sessions_evict_oldest() {
        let view = make_view(4);
        let strategy = SessionPersistence::with_capacity(2);

        for i in 0..5 {
            let ctx = SelectionContext::new().with_session_key(format!("user-{i}"));
            strategy.select(&view, &ctx).unwrap();
        }
        assert_eq!(strategy.sessions.lock().len(), 2);
    }

    #[test]
    fn skips_proxies_failed_for_this_request() {
        let view = make_view(3);
        let strategy = SessionPersistence::new();
        let ctx = SelectionContext::new().with_session_key("user-42");

        let sticky = strategy.select(&view, &ctx).unwrap();

        let mut retry_ctx = ctx.clone();
        retry_ctx.mark_failed(sticky.id);
        let other = strategy.select(&view, &retry_ctx).unwrap();
        assert_ne!(other.id, sticky.id);
    }
}
