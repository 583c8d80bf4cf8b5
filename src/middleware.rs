//! Middleware implementation for reqwest.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};

use crate::error::Error as RotationError;
use crate::rotator::Rotator;
use crate::strategy::{Outcome, SelectionContext};
use crate::transport::classify_reqwest_error;

/// Middleware that routes every reqwest request through the rotator's pool.
///
/// The selection/record seam of [`Rotator`] drives the loop; the actual
/// transport stays inside reqwest so streaming responses work unchanged.
#[derive(Clone)]
pub struct RotatorMiddleware {
    rotator: Arc<Rotator>,
    max_retries: u32,
}

impl RotatorMiddleware {
    pub fn new(rotator: Arc<Rotator>) -> Self {
        let max_retries = rotator.config().max_retries;
        RotatorMiddleware {
            rotator,
            max_retries,
        }
    }
}

#[async_trait]
impl Middleware for RotatorMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let mut ctx = SelectionContext::new();

        for attempt in 0..=self.max_retries {
            ctx.attempt = attempt;

            let proxy = match self.rotator.select_proxy(&ctx) {
                Ok(proxy) => proxy,
                Err(err) => {
                    let summary = self.rotator.pool().summary();
                    warn!(
                        "No proxy available. Total: {}, healthy: {}",
                        summary.total, summary.healthy
                    );
                    return Err(Error::Middleware(anyhow!(err)));
                }
            };

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                ))
            })?;

            info!("Using proxy {} (attempt {})", proxy.endpoint, attempt + 1);

            if let Some(throttle) = proxy.throttle() {
                throttle.until_ready().await;
            }

            let reqwest_proxy = match proxy.to_reqwest_proxy() {
                Ok(p) => p,
                Err(err) => {
                    warn!("Failed to build proxy for {}: {}", proxy.endpoint, err);
                    ctx.mark_failed(proxy.id);
                    continue;
                }
            };

            let client = match reqwest::Client::builder().proxy(reqwest_proxy).build() {
                Ok(client) => client,
                Err(e) => {
                    warn!("Failed to build client for {}: {}", proxy.endpoint, e);
                    ctx.mark_failed(proxy.id);
                    continue;
                }
            };

            self.rotator.pool().record_dispatch(proxy.id);
            let started = Instant::now();
            match client.execute(proxied_request).await {
                Ok(response) => {
                    let outcome = Outcome::Ok {
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                    self.rotator.record_outcome(&proxy, &outcome);
                    return Ok(response);
                }
                Err(err) => {
                    warn!(
                        "Request via {} failed (attempt {}): {}",
                        proxy.endpoint,
                        attempt + 1,
                        err
                    );
                    let outcome = Outcome::Fail {
                        error_kind: classify_reqwest_error(&err),
                    };
                    self.rotator.record_outcome(&proxy, &outcome);
                    ctx.mark_failed(proxy.id);

                    if attempt == self.max_retries {
                        return Err(Error::Reqwest(err));
                    }
                }
            }
        }

        Err(Error::Middleware(anyhow!(RotationError::NoProxiesAvailable)))
    }
}
