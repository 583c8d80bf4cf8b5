//! Request/response types and the transport seam the rotator forwards
//! through.

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::proxy::{Proxy, ProxyId};

/// An application-level HTTP request to forward through a proxy.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Per-request deadline; the rotator falls back to its configured
    /// default when unset.
    pub timeout: Option<Duration>,
    /// Sticky-session token fed into the selection context.
    pub session_key: Option<String>,
    /// Geo constraints fed into the selection context.
    pub target_country: Option<String>,
    pub target_region: Option<String>,
}

impl ForwardRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        ForwardRequest {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            session_key: None,
            target_country: None,
            target_region: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
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

    /// Host component of the target URL; the rate limiter's route key.
    pub fn endpoint_key(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// What the transport hands back on success.
#[derive(Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// The rotator's response: transport payload plus which proxy carried it.
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub proxy_id: ProxyId,
    pub latency_ms: u64,
}

/// Classified transport failure. The message is redaction-safe; it never
/// embeds the authenticated proxy URL.
#[derive(Debug, Error)]
#[error("transport error ({kind:?}): {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }
}

/// The seam between the rotator and the wire. Production uses
/// [`ReqwestTransport`]; tests script failures through their own impls.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        proxy: &Proxy,
        req: &ForwardRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// Production transport over reqwest.
///
/// reqwest fixes the proxy at client construction, so each proxy gets its
/// own client; the clients live in a bounded LRU and are shared across
/// concurrent forwards, which keeps per-proxy connection pools alive
/// between requests. SOCKS and HTTP proxies end up in separate clients by
/// construction.
pub struct ReqwestTransport {
    clients: Mutex<LruCache<ProxyId, reqwest::Client>>,
    connect_timeout: Duration,
    default_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration, default_timeout: Duration, cache_size: usize) -> Self {
        ReqwestTransport {
            clients: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
            connect_timeout,
            default_timeout,
        }
    }

    fn client_for(&self, proxy: &Proxy) -> std::result::Result<reqwest::Client, TransportError> {
        if let Some(client) = self.clients.lock().get(&proxy.id) {
            return Ok(client.clone());
        }

        let reqwest_proxy = proxy.to_reqwest_proxy().map_err(|_| {
            TransportError::new(
                ErrorKind::Other,
                format!("invalid proxy endpoint {}", proxy.endpoint),
            )
        })?;
        let client = reqwest::Client::builder()
            .proxy(reqwest_proxy)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| {
                TransportError::new(ErrorKind::Other, format!("client build failed: {e}"))
            })?;

        self.clients.lock().put(proxy.id, client.clone());
        Ok(client)
    }

    /// Drop the cached client for a proxy, e.g. after eviction.
    pub fn invalidate(&self, id: ProxyId) {
        self.clients.lock().pop(&id);
    }
}

/// Map a reqwest failure onto the error taxonomy.
pub(crate) fn classify_reqwest_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        if err.is_connect() {
            return ErrorKind::ConnectTimeout;
        }
        return ErrorKind::ReadTimeout;
    }
    if err.is_connect() {
        return ErrorKind::ConnectError;
    }
    let message = err.to_string().to_ascii_lowercase();
    if message.contains("tls") || message.contains("certificate") || message.contains("ssl") {
        return ErrorKind::TlsError;
    }
    ErrorKind::Other
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        proxy: &Proxy,
        req: &ForwardRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let client = self.client_for(proxy)?;

        let mut builder = client
            .request(req.method.clone(), &req.url)
            .headers(req.headers.clone())
            .timeout(req.timeout.unwrap_or(self.default_timeout));
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            TransportError::new(classify_reqwest_error(&e), format!("send failed: {e}"))
        })?;

        // A 407 comes from the proxy, not the origin: fail over instead of
        // handing it to the caller.
        if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(TransportError::new(
                ErrorKind::ProxyAuthFailed,
                format!("proxy {} rejected credentials", proxy.endpoint),
            ));
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| {
                TransportError::new(classify_reqwest_error(&e), format!("body read failed: {e}"))
            })?
            .to_vec();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyEndpoint, ProxyScheme};

    #[test]
    fn endpoint_key_is_the_target_host() {
        let req = ForwardRequest::get("https://api.example.com/v1/things?page=2");
        assert_eq!(req.endpoint_key(), "api.example.com");
    }

    #[test]
    fn endpoint_key_survives_unparseable_urls() {
        let req = ForwardRequest::get("not a url");
        assert_eq!(req.endpoint_key(), "not a url");
    }

    #[test]
    fn client_cache_reuses_and_invalidates() {
        let transport = ReqwestTransport::new(
            Duration::from_secs(5),
            Duration::from_secs(30),
            8,
        );
        let proxy = Proxy::new(ProxyEndpoint::new(ProxyScheme::Http, "10.0.0.1", 8080));

        transport.client_for(&proxy).unwrap();
        assert_eq!(transport.clients.lock().len(), 1);
        transport.client_for(&proxy).unwrap();
        assert_eq!(transport.clients.lock().len(), 1);

        transport.invalidate(proxy.id);
        assert_eq!(transport.clients.lock().len(), 0);
    }

    #[test]
    fn request_builder_helpers() {
        let req = ForwardRequest::get("http://example.com")
            .with_timeout(Duration::from_secs(3))
            .with_body(b"payload".to_vec());
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.timeout, Some(Duration::from_secs(3)));
        assert_eq!(req.body.as_deref(), Some(b"payload".as_ref()));
    }
}
