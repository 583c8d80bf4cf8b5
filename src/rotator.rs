//! The rotator: select a proxy, forward the request, record the outcome,
//! fail over.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::config::RotatorConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::pool::ProxyPool;
use crate::proxy::Proxy;
use crate::ratelimit::{Decision, Identifier, RateLimiter};
use crate::strategy::{Outcome, RotationStrategy, SelectionContext, StrategyRegistry};
use crate::transport::{ForwardRequest, ForwardResponse, ReqwestTransport, Transport};

/// Orchestrates request forwarding over a pool of proxies.
///
/// The strategy is published through a `RwLock<Arc<_>>`: swaps are atomic,
/// and a forward captures the Arc once at entry, so in-flight requests
/// finish on the strategy they started with while new forwards pick up the
/// replacement.
pub struct Rotator {
    pool: Arc<ProxyPool>,
    strategy: RwLock<Arc<dyn RotationStrategy>>,
    transport: Arc<dyn Transport>,
    limiter: RwLock<Option<Arc<RateLimiter>>>,
    config: RotatorConfig,
}

impl Rotator {
    /// Build a rotator with the production reqwest transport.
    pub fn new(pool: Arc<ProxyPool>, config: RotatorConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            config.connect_timeout,
            config.request_timeout,
            config.client_cache_size,
        ));
        Self::with_transport(pool, config, transport)
    }

    /// Build a rotator over a custom transport (tests, exotic wire setups).
    pub fn with_transport(
        pool: Arc<ProxyPool>,
        config: RotatorConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let strategy = StrategyRegistry::global().get(&config.default_strategy)?;
        if config.max_rps_per_proxy.is_some() {
            pool.set_default_max_rps(config.max_rps_per_proxy);
        }
        Ok(Rotator {
            pool,
            strategy: RwLock::new(strategy),
            transport,
            limiter: RwLock::new(None),
            config,
        })
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    /// Name of the currently published strategy.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.read().name()
    }

    /// Atomically replace the strategy. In-flight forwards keep the one
    /// they captured.
    pub fn set_strategy(&self, strategy: Arc<dyn RotationStrategy>) {
        let name = strategy.name();
        *self.strategy.write() = strategy;
        info!("Rotator strategy set to {}", name);
    }

    /// Replace the strategy by registry name.
    pub fn set_strategy_by_name(&self, name: &str) -> Result<()> {
        let strategy = StrategyRegistry::global().get(name)?;
        self.set_strategy(strategy);
        Ok(())
    }

    /// Attach (or replace) the rate limiter consulted before each forward.
    pub fn attach_rate_limiter(&self, limiter: Arc<RateLimiter>) {
        *self.limiter.write() = Some(limiter);
    }

    /// One selection against the current healthy view. The seam used by
    /// the middleware adapter and handler layers that transport requests
    /// themselves.
    pub fn select_proxy(&self, ctx: &SelectionContext) -> Result<Proxy> {
        let strategy = self.strategy.read().clone();
        strategy.select(&self.pool.healthy_view(Utc::now()), ctx)
    }

    /// Feed back an outcome observed outside [`Rotator::forward`].
    pub fn record_outcome(&self, proxy: &Proxy, outcome: &Outcome) {
        self.pool.update_stats(proxy.id, outcome);
        self.strategy.read().record_result(proxy, outcome);
    }

    /// Forward `req` through the pool, failing over across proxies.
    ///
    /// Transport success returns the response whatever its HTTP status;
    /// a 4xx/5xx from the origin is the origin's business. Target-origin
    /// failures count as successes for the proxy that carried them but
    /// still trigger fail-over in case another proxy has a usable route.
    pub async fn forward(
        &self,
        req: ForwardRequest,
        identifier: Option<&Identifier>,
    ) -> Result<ForwardResponse> {
        if let Some(identifier) = identifier {
            let limiter = self.limiter.read().clone();
            if let Some(limiter) = limiter {
                match limiter.check(identifier, &req.endpoint_key()).await? {
                    Decision::Denied { retry_after, .. } => {
                        return Err(Error::RateLimited { retry_after });
                    }
                    Decision::Allowed { .. } | Decision::Bypassed => {}
                }
            }
        }

        let strategy = self.strategy.read().clone();
        let deadline = tokio::time::Instant::now()
            + req.timeout.unwrap_or(self.config.request_timeout);

        let mut ctx = SelectionContext {
            session_key: req.session_key.clone(),
            target_country: req.target_country.clone(),
            target_region: req.target_region.clone(),
            ..SelectionContext::new()
        };
        let mut attempts = 0u32;
        let mut transport_failures = 0u32;
        let mut target_failures = 0u32;
        let mut last_transport_kind = None;
        let mut last_target_kind = None;

        for attempt in 0..=self.config.max_retries {
            ctx.attempt = attempt;
            let view = self.pool.healthy_view(Utc::now());
            let proxy = match strategy.select(&view, &ctx) {
                Ok(proxy) => proxy,
                Err(_) => break,
            };
            attempts += 1;

            if let Some(throttle) = proxy.throttle() {
                throttle.until_ready().await;
            }

            self.pool.record_dispatch(proxy.id);
            debug!(
                "Forwarding {} {} via {} (attempt {})",
                req.method,
                req.url,
                proxy.endpoint,
                attempt + 1
            );
            let started = Instant::now();

            let result =
                match tokio::time::timeout_at(deadline, self.transport.send(&proxy, &req)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let outcome = Outcome::Fail {
                            error_kind: ErrorKind::ReadTimeout,
                        };
                        self.pool.update_stats(proxy.id, &outcome);
                        strategy.record_result(&proxy, &outcome);
                        return Err(Error::RequestTimeout);
                    }
                };

            let latency_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(response) => {
                    let outcome = Outcome::Ok { latency_ms };
                    self.pool.update_stats(proxy.id, &outcome);
                    strategy.record_result(&proxy, &outcome);
                    return Ok(ForwardResponse {
                        status: response.status,
                        headers: response.headers,
                        body: response.body,
                        proxy_id: proxy.id,
                        latency_ms,
                    });
                }
                Err(err) if err.kind.is_target_failure() => {
                    // The proxy held up its end; the origin did not.
                    let outcome = Outcome::Ok { latency_ms };
                    self.pool.update_stats(proxy.id, &outcome);
                    strategy.record_result(&proxy, &outcome);
                    warn!(
                        "Origin unreachable via {} (attempt {}): {:?}",
                        proxy.endpoint,
                        attempt + 1,
                        err.kind
                    );
                    target_failures += 1;
                    last_target_kind = Some(err.kind);
                    ctx.mark_failed(proxy.id);
                }
                Err(err) => {
                    warn!(
                        "Request via {} failed (attempt {}): {}",
                        proxy.endpoint,
                        attempt + 1,
                        err
                    );
                    let outcome = Outcome::Fail {
                        error_kind: err.kind,
                    };
                    self.pool.update_stats(proxy.id, &outcome);
                    strategy.record_result(&proxy, &outcome);
                    transport_failures += 1;
                    last_transport_kind = Some(err.kind);
                    ctx.mark_failed(proxy.id);
                }
            }
        }

        if attempts == 0 {
            return Err(Error::NoProxiesAvailable);
        }
        if transport_failures == 0 && target_failures > 0 {
            return Err(Error::TargetUnreachable);
        }
        Err(Error::AllProxiesFailed {
            attempts,
            last_error_kind: last_transport_kind
                .or(last_target_kind)
                .unwrap_or(ErrorKind::Other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testutil::make_proxy;
    use crate::transport::{TransportError, TransportResponse};
    use async_trait::async_trait;
    use http::{HeaderMap, StatusCode};

    /// Scripted transport: hosts listed in `failing` refuse connections.
    struct ScriptedTransport {
        failing: Vec<String>,
        status: StatusCode,
    }

    impl ScriptedTransport {
        fn ok() -> Self {
            ScriptedTransport {
                failing: Vec::new(),
                status: StatusCode::OK,
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            proxy: &Proxy,
            _req: &ForwardRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            if self.failing.contains(&proxy.endpoint.host) {
                return Err(TransportError::new(
                    ErrorKind::ConnectError,
                    "connection refused",
                ));
            }
            Ok(TransportResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: b"ok".to_vec(),
            })
        }
    }

    fn rotator_with(transport: ScriptedTransport, proxies: u16) -> (Rotator, Vec<Proxy>) {
        let pool = Arc::new(ProxyPool::new());
        let mut added = Vec::new();
        for i in 0..proxies {
            let proxy = make_proxy(i);
            pool.add(proxy.clone()).unwrap();
            added.push(proxy);
        }
        let rotator = Rotator::with_transport(
            pool,
            RotatorConfig::default(),
            Arc::new(transport),
        )
        .unwrap();
        (rotator, added)
    }

    #[tokio::test]
    async fn forward_returns_the_carrying_proxy() {
        let (rotator, _) = rotator_with(ScriptedTransport::ok(), 2);
        let response = rotator
            .forward(ForwardRequest::get("http://origin.test/"), None)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(rotator.pool().get(response.proxy_id).is_some());
    }

    #[tokio::test]
    async fn origin_errors_pass_through() {
        let (rotator, _) = rotator_with(
            ScriptedTransport {
                failing: Vec::new(),
                status: StatusCode::INTERNAL_SERVER_ERROR,
            },
            1,
        );
        let response = rotator
            .forward(ForwardRequest::get("http://origin.test/"), None)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

        // A 5xx is not a proxy failure.
        let proxy = rotator.pool().list().remove(0);
        assert_eq!(proxy.stats.failed_requests, 0);
        assert_eq!(proxy.stats.successful_requests, 1);
    }

    #[tokio::test]
    async fn empty_pool_reports_pool_empty() {
        let (rotator, _) = rotator_with(ScriptedTransport::ok(), 0);
        let err = rotator
            .forward(ForwardRequest::get("http://origin.test/"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROXY_POOL_EMPTY");
    }

    #[tokio::test]
    async fn all_failing_reports_failover_exhausted() {
        let (rotator, proxies) = rotator_with(
            ScriptedTransport {
                failing: proxies_hosts(3),
                status: StatusCode::OK,
            },
            3,
        );
        let err = rotator
            .forward(ForwardRequest::get("http://origin.test/"), None)
            .await
            .unwrap_err();
        match err {
            Error::AllProxiesFailed {
                attempts,
                last_error_kind,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error_kind, ErrorKind::ConnectError);
            }
            other => panic!("unexpected error {other:?}"),
        }
        for proxy in &proxies {
            let current = rotator.pool().get(proxy.id).unwrap();
            assert_eq!(current.stats.failed_requests, 1);
        }
    }

    fn proxies_hosts(count: u16) -> Vec<String> {
        (0..count).map(|i| format!("10.0.0.{i}")).collect()
    }

    #[tokio::test]
    async fn hot_swap_changes_future_selections() {
        let (rotator, _) = rotator_with(ScriptedTransport::ok(), 3);
        assert_eq!(rotator.strategy_name(), "round-robin");

        rotator.set_strategy_by_name("random").unwrap();
        assert_eq!(rotator.strategy_name(), "random");

        assert!(rotator.set_strategy_by_name("nope").is_err());
        assert_eq!(rotator.strategy_name(), "random");
    }

    #[tokio::test]
    async fn config_rps_cap_reaches_pool_members() {
        let pool = Arc::new(ProxyPool::new());
        pool.add(make_proxy(0)).unwrap();

        let rotator = Rotator::with_transport(
            Arc::clone(&pool),
            RotatorConfig::builder().max_rps_per_proxy(100.0).build(),
            Arc::new(ScriptedTransport::ok()),
        )
        .unwrap();

        assert!(pool.list().iter().all(|p| p.has_throttle()));
        // The capped proxy still carries traffic.
        rotator
            .forward(ForwardRequest::get("http://origin.test/"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn select_and_record_are_usable_standalone() {
        let (rotator, _) = rotator_with(ScriptedTransport::ok(), 2);
        let ctx = SelectionContext::new();
        let proxy = rotator.select_proxy(&ctx).unwrap();
        rotator.record_outcome(&proxy, &Outcome::Ok { latency_ms: 12 });
        let updated = rotator.pool().get(proxy.id).unwrap();
        assert_eq!(updated.stats.successful_requests, 1);
    }
}
