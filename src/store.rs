//! Narrow persistence interface for pool snapshots.
//!
//! The engine does not own a storage backend; it hands a fully-serializable
//! snapshot to whatever implements [`Store`]. Credential material crosses
//! the boundary exactly once, in [`ProxyRecord::from_proxy`], which is the
//! explicit `reveal()` point for storage backends with their own encryption
//! policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proxy::{
    HealthState, Proxy, ProxyCredentials, ProxyEndpoint, ProxyId, ProxyStats, SourceTag,
};
use crate::secret::Secret;

/// Storage DTO for one proxy: identity fields, revealed credentials, and
/// the persisted slice of the mutable cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: ProxyId,
    pub endpoint: ProxyEndpoint,
    pub username: Option<String>,
    pub password: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub source: SourceTag,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: Option<u64>,
    pub health: HealthState,
    pub stats: ProxyStats,
}

impl ProxyRecord {
    pub fn from_proxy(proxy: &Proxy) -> Self {
        ProxyRecord {
            id: proxy.id,
            endpoint: proxy.endpoint.clone(),
            username: proxy.credentials.as_ref().map(|c| c.username.clone()),
            password: proxy
                .credentials
                .as_ref()
                .map(|c| c.password.reveal().to_string()),
            country_code: proxy.country_code.clone(),
            region: proxy.region.clone(),
            source: proxy.source.clone(),
            created_at: proxy.created_at,
            ttl_seconds: proxy.ttl_seconds,
            health: proxy.health,
            stats: proxy.stats.clone(),
        }
    }

    pub fn into_proxy(self) -> Proxy {
        let mut proxy = Proxy::new(self.endpoint);
        proxy.id = self.id;
        proxy.credentials = match (self.username, self.password) {
            (Some(username), Some(password)) => {
                Some(ProxyCredentials::new(username, Secret::new(password)))
            }
            _ => None,
        };
        proxy.country_code = self.country_code;
        proxy.region = self.region;
        proxy.source = self.source;
        proxy.created_at = self.created_at;
        proxy.ttl_seconds = self.ttl_seconds;
        proxy.health = self.health;
        proxy.stats = self.stats;
        proxy
    }
}

/// Serialized image of a pool at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub taken_at: DateTime<Utc>,
    pub proxies: Vec<ProxyRecord>,
}

/// Narrow persistence seam. Backends (file, embedded SQL, ...) live outside
/// the core; the engine ships an in-memory implementation only.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, snapshot: &PoolSnapshot) -> Result<()>;

    async fn load(&self) -> Result<Option<PoolSnapshot>>;
}

/// In-memory store, round-tripping through JSON so that what a real backend
/// would persist is exactly what tests exercise.
pub struct MemoryStore {
    inner: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(None),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, snapshot: &PoolSnapshot) -> Result<()> {
        let encoded = serde_json::to_string(snapshot)
            .map_err(|e| Error::ValidationError(format!("snapshot encoding failed: {e}")))?;
        *self.inner.lock() = Some(encoded);
        Ok(())
    }

    async fn load(&self) -> Result<Option<PoolSnapshot>> {
        let guard = self.inner.lock();
        match guard.as_deref() {
            None => Ok(None),
            Some(encoded) => serde_json::from_str(encoded)
                .map(Some)
                .map_err(|e| Error::ValidationError(format!("snapshot decoding failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ProxyPool;
    use crate::proxy::{ProxyEndpoint, ProxyScheme};

    fn seeded_pool() -> ProxyPool {
        let pool = ProxyPool::new();
        pool.add(
            Proxy::new(ProxyEndpoint::new(ProxyScheme::Socks5, "10.0.0.1", 1080))
                .with_credentials(ProxyCredentials::new("user", "hunter2"))
                .with_country("US")
                .with_region("NA")
                .with_ttl_seconds(3600),
        )
        .unwrap();
        pool.add(
            Proxy::new(ProxyEndpoint::new(ProxyScheme::Http, "10.0.0.2", 8080))
                .with_source(SourceTag::Fetched("free-list".into())),
        )
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn save_then_load_round_trips_membership() {
        let pool = seeded_pool();
        let store = MemoryStore::new();

        store.save(&pool.snapshot()).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        let restored = ProxyPool::restore(loaded, None);

        let original = pool.list();
        let recovered = restored.list();
        assert_eq!(original.len(), recovered.len());
        for (a, b) in original.iter().zip(recovered.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.endpoint, b.endpoint);
            assert_eq!(a.credentials, b.credentials);
            assert_eq!(a.country_code, b.country_code);
            assert_eq!(a.region, b.region);
            assert_eq!(a.source, b.source);
            assert_eq!(a.created_at, b.created_at);
            assert_eq!(a.ttl_seconds, b.ttl_seconds);
        }
    }

    #[tokio::test]
    async fn empty_store_loads_nothing() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_none());
    }

    #[test]
    fn record_reveals_credentials_for_storage_only() {
        let proxy = Proxy::new(ProxyEndpoint::new(ProxyScheme::Http, "10.0.0.1", 8080))
            .with_credentials(ProxyCredentials::new("user", "hunter2"));

        let record = ProxyRecord::from_proxy(&proxy);
        assert_eq!(record.password.as_deref(), Some("hunter2"));

        // The record is the storage boundary; the rebuilt proxy redacts again.
        let rebuilt = record.into_proxy();
        let rendered = format!("{:?}", rebuilt);
        assert!(!rendered.contains("hunter2"));
    }
}
