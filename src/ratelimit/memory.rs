//! Process-local sliding-window store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{StoreError, WindowDecision, WindowStore};

/// Sweep candidate keys every this many operations.
const SWEEP_EVERY: u64 = 256;

struct Window {
    events: VecDeque<u64>,
    expires_at_ms: u64,
}

/// A mutex over an ordered map of event timestamps: the single-instance
/// fallback for the shared key-value store. The whole drop→count→append
/// sequence runs under one lock acquisition per call, so concurrent
/// callers on the same key serialize and the limit is never oversubscribed.
pub struct InMemoryWindowStore {
    windows: Mutex<HashMap<String, Window>>,
    ops: AtomicU64,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        InMemoryWindowStore {
            windows: Mutex::new(HashMap::new()),
            ops: AtomicU64::new(0),
        }
    }

    /// Number of live keys, after dropping those past their TTL.
    pub fn key_count(&self, now_ms: u64) -> usize {
        let mut windows = self.windows.lock();
        windows.retain(|_, w| w.expires_at_ms > now_ms);
        windows.len()
    }
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn check_and_append(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
        now_ms: u64,
    ) -> std::result::Result<WindowDecision, StoreError> {
        let mut windows = self.windows.lock();

        // Opportunistic TTL sweep keeps memory bounded by active keys.
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == 0 {
            windows.retain(|_, w| w.expires_at_ms > now_ms);
        }

        let window = windows.entry(key.to_string()).or_insert_with(|| Window {
            events: VecDeque::new(),
            expires_at_ms: 0,
        });

        let cutoff = now_ms.saturating_sub(window_ms);
        while matches!(window.events.front(), Some(&ts) if ts < cutoff) {
            window.events.pop_front();
        }

        let used = window.events.len() as u32;
        window.expires_at_ms = now_ms + 2 * window_ms;

        if used >= limit {
            // Denied requests leave the window untouched.
            Ok(WindowDecision {
                allowed: false,
                used,
                oldest_ms: window.events.front().copied(),
            })
        } else {
            window.events.push_back(now_ms);
            Ok(WindowDecision {
                allowed: true,
                used,
                oldest_ms: window.events.front().copied(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denied_calls_leave_the_window_unchanged() {
        let store = InMemoryWindowStore::new();

        for _ in 0..2 {
            let d = store.check_and_append("k", 2, 60_000, 1_000).await.unwrap();
            assert!(d.allowed);
        }
        let denied = store.check_and_append("k", 2, 60_000, 2_000).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.used, 2);

        // Still exactly two events: the denial appended nothing.
        let denied_again = store.check_and_append("k", 2, 60_000, 3_000).await.unwrap();
        assert_eq!(denied_again.used, 2);
    }

    #[tokio::test]
    async fn old_events_fall_out_of_the_window() {
        let store = InMemoryWindowStore::new();
        store.check_and_append("k", 10, 60_000, 0).await.unwrap();
        store.check_and_append("k", 10, 60_000, 30_000).await.unwrap();

        let later = store
            .check_and_append("k", 10, 60_000, 61_000)
            .await
            .unwrap();
        // The t=0 event is gone; t=30s remains.
        assert_eq!(later.used, 1);
        assert_eq!(later.oldest_ms, Some(30_000));
    }

    #[tokio::test]
    async fn ttl_is_twice_the_window() {
        let store = InMemoryWindowStore::new();
        store.check_and_append("k", 10, 60_000, 0).await.unwrap();

        assert_eq!(store.key_count(119_000), 1);
        assert_eq!(store.key_count(121_000), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_callers_never_oversubscribe() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryWindowStore::new());
        let limit = 50u32;

        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .check_and_append("k", limit, 60_000, 1_000)
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, limit);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = InMemoryWindowStore::new();
        let a = store.check_and_append("a", 1, 60_000, 0).await.unwrap();
        let b = store.check_and_append("b", 1, 60_000, 0).await.unwrap();
        assert!(a.allowed && b.allowed);
    }
}
