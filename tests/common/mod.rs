//! Shared test fixtures: a scriptable transport and pool builders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;

use proxywhirl::{
    ErrorKind, ForwardRequest, Proxy, ProxyEndpoint, ProxyPool, ProxyScheme, Transport,
    TransportError, TransportResponse,
};

/// Per-host scripted behavior.
#[derive(Clone)]
pub enum Behavior {
    Ok { delay: Duration },
    Fail { kind: ErrorKind },
}

impl Behavior {
    pub fn ok() -> Self {
        Behavior::Ok {
            delay: Duration::ZERO,
        }
    }

    pub fn ok_after(delay: Duration) -> Self {
        Behavior::Ok { delay }
    }

    pub fn fail(kind: ErrorKind) -> Self {
        Behavior::Fail { kind }
    }
}

/// Transport with scripted per-proxy-host behavior and an attempt log.
pub struct MockTransport {
    behaviors: Mutex<HashMap<String, Behavior>>,
    default: Mutex<Behavior>,
    attempts: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            behaviors: Mutex::new(HashMap::new()),
            default: Mutex::new(Behavior::ok()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, host: &str, behavior: Behavior) {
        self.behaviors.lock().insert(host.to_string(), behavior);
    }

    pub fn set_default(&self, behavior: Behavior) {
        *self.default.lock() = behavior;
    }

    /// Hosts in attempt order, successes and failures alike.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        proxy: &Proxy,
        _req: &ForwardRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.attempts.lock().push(proxy.endpoint.host.clone());
        let behavior = self
            .behaviors
            .lock()
            .get(&proxy.endpoint.host)
            .cloned()
            .unwrap_or_else(|| self.default.lock().clone());

        match behavior {
            Behavior::Ok { delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(TransportResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: b"ok".to_vec(),
                })
            }
            Behavior::Fail { kind } => Err(TransportError::new(kind, "scripted failure")),
        }
    }
}

/// Pool seeded with `hosts`, one proxy per host on port 8080.
pub fn pool_of(hosts: &[&str]) -> (Arc<ProxyPool>, HashMap<String, Proxy>) {
    let pool = Arc::new(ProxyPool::new());
    let mut by_host = HashMap::new();
    for host in hosts {
        let proxy = Proxy::new(ProxyEndpoint::new(ProxyScheme::Http, *host, 8080));
        pool.add(proxy.clone()).unwrap();
        by_host.insert(host.to_string(), proxy);
    }
    (pool, by_host)
}
