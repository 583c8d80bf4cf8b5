//! Proxy validation: TCP reachability, HTTP probing, anonymity grading.

use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::ErrorKind;
use crate::proxy::{Proxy, ProxyEndpoint, ProxyId};
use crate::transport::classify_reqwest_error;

/// Probe depth, strictly increasing in cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// TCP connect to `(host, port)` within the timeout.
    Basic,
    /// Basic plus one HTTP GET through the proxy, asserting 2xx.
    Standard,
    /// Standard plus anonymity classification from an echo origin.
    Full,
}

/// How much of the caller leaks through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    /// The origin sees the real client address.
    Transparent,
    /// The origin sees that a proxy is involved, but not the client.
    Anonymous,
    /// The origin sees neither.
    Elite,
}

/// Outcome of probing one proxy. The validator never mutates the pool; the
/// caller decides whether and how to apply results.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub proxy_id: ProxyId,
    pub endpoint: ProxyEndpoint,
    pub level_reached: ValidationLevel,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error_kind: Option<ErrorKind>,
    pub anonymity: Option<AnonymityLevel>,
}

/// Configuration for a [`Validator`].
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// URL fetched through the proxy at Standard and Full levels. At Full
    /// level the response body is expected to echo request headers as JSON
    /// (httpbin-style).
    pub probe_url: String,
    pub timeout: Duration,
    /// Batch concurrency cap.
    pub concurrency: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            probe_url: "https://httpbin.org/headers".to_string(),
            timeout: Duration::from_secs(10),
            concurrency: 32,
        }
    }
}

/// Stateless prober. Probe clients are built per proxy (reqwest binds the
/// proxy at client construction), which also keeps SOCKS and HTTP schemes
/// in separate client families.
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Validator { config }
    }

    /// Probe a single proxy to the requested depth.
    pub async fn validate(&self, proxy: &Proxy, level: ValidationLevel) -> ValidationResult {
        let started = Instant::now();

        // Level 1: raw TCP reach.
        let address = (proxy.endpoint.host.as_str(), proxy.endpoint.port);
        match timeout(self.config.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => {}
            Ok(Err(e)) => {
                debug!("TCP probe of {} failed: {}", proxy.endpoint, e);
                return self.failed(proxy, ValidationLevel::Basic, ErrorKind::ConnectError);
            }
            Err(_) => {
                return self.failed(proxy, ValidationLevel::Basic, ErrorKind::ConnectTimeout);
            }
        }
        if level == ValidationLevel::Basic {
            return self.succeeded(proxy, ValidationLevel::Basic, started, None);
        }

        // Level 2: one GET through the proxy.
        let client = match self.probe_client(proxy) {
            Ok(client) => client,
            Err(kind) => return self.failed(proxy, ValidationLevel::Standard, kind),
        };
        let response = match client.get(&self.config.probe_url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(
                    "HTTP probe of {} returned {}",
                    proxy.endpoint,
                    response.status()
                );
                return self.failed(proxy, ValidationLevel::Standard, ErrorKind::Other);
            }
            Err(e) => {
                debug!("HTTP probe of {} failed: {}", proxy.endpoint, e);
                return self.failed(
                    proxy,
                    ValidationLevel::Standard,
                    classify_reqwest_error(&e),
                );
            }
        };
        if level == ValidationLevel::Standard {
            return self.succeeded(proxy, ValidationLevel::Standard, started, None);
        }

        // Level 3: what does the origin see?
        let anonymity = match response.json::<serde_json::Value>().await {
            Ok(body) => Some(classify_anonymity(&body)),
            Err(e) => {
                debug!("Anonymity probe of {} unparsable: {}", proxy.endpoint, e);
                None
            }
        };
        self.succeeded(proxy, ValidationLevel::Full, started, anonymity)
    }

    /// Probe many proxies with bounded concurrency. Result order follows
    /// completion, not input.
    pub async fn validate_batch(
        &self,
        proxies: &[Proxy],
        level: ValidationLevel,
    ) -> Vec<ValidationResult> {
        stream::iter(proxies.iter().cloned())
            .map(|proxy| async move { self.validate(&proxy, level).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await
    }

    fn probe_client(&self, proxy: &Proxy) -> std::result::Result<reqwest::Client, ErrorKind> {
        let reqwest_proxy = proxy.to_reqwest_proxy().map_err(|_| ErrorKind::Other)?;
        reqwest::Client::builder()
            .proxy(reqwest_proxy)
            .timeout(self.config.timeout)
            .build()
            .map_err(|e| {
                warn!("Probe client build failed for {}: {}", proxy.endpoint, e);
                ErrorKind::Other
            })
    }

    fn succeeded(
        &self,
        proxy: &Proxy,
        level: ValidationLevel,
        started: Instant,
        anonymity: Option<AnonymityLevel>,
    ) -> ValidationResult {
        ValidationResult {
            proxy_id: proxy.id,
            endpoint: proxy.endpoint.clone(),
            level_reached: level,
            success: true,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error_kind: None,
            anonymity,
        }
    }

    fn failed(&self, proxy: &Proxy, level: ValidationLevel, kind: ErrorKind) -> ValidationResult {
        ValidationResult {
            proxy_id: proxy.id,
            endpoint: proxy.endpoint.clone(),
            level_reached: level,
            success: false,
            latency_ms: None,
            error_kind: Some(kind),
            anonymity: None,
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

/// Grade anonymity from an httpbin-style `{"headers": {...}}` echo.
///
/// `X-Forwarded-For` visible means the origin can see the client address;
/// `Via` alone means it only sees that a proxy is involved.
fn classify_anonymity(body: &serde_json::Value) -> AnonymityLevel {
    let headers = body.get("headers").unwrap_or(body);
    let has = |name: &str| {
        headers
            .as_object()
            .map(|map| {
                map.keys()
                    .any(|k| k.eq_ignore_ascii_case(name))
            })
            .unwrap_or(false)
    };

    if has("x-forwarded-for") {
        AnonymityLevel::Transparent
    } else if has("via") {
        AnonymityLevel::Anonymous
    } else {
        AnonymityLevel::Elite
    }
}
