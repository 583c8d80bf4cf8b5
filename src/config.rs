//! Configuration for the rotator.

use std::time::Duration;

/// Configuration for a [`crate::rotator::Rotator`].
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    /// Number of times to fail over to another proxy after the first attempt.
    pub max_retries: u32,
    /// Default per-request deadline when the request sets none.
    pub request_timeout: Duration,
    /// Connect timeout for proxy clients.
    pub connect_timeout: Duration,
    /// Default requests-per-second cap installed on every pool member
    /// without a cap of its own; `None` leaves proxies unthrottled.
    pub max_rps_per_proxy: Option<f64>,
    /// Strategy used until the caller swaps one in, by registry name.
    pub default_strategy: String,
    /// Cap on cached per-proxy HTTP clients.
    pub client_cache_size: usize,
}

impl RotatorConfig {
    /// Create a new configuration builder.
    pub fn builder() -> RotatorConfigBuilder {
        RotatorConfigBuilder::new()
    }
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for `RotatorConfig`.
pub struct RotatorConfigBuilder {
    max_retries: Option<u32>,
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    max_rps_per_proxy: Option<f64>,
    default_strategy: Option<String>,
    client_cache_size: Option<usize>,
}

impl RotatorConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            max_retries: None,
            request_timeout: None,
            connect_timeout: None,
            max_rps_per_proxy: None,
            default_strategy: None,
            client_cache_size: None,
        }
    }

    /// Set the number of fail-over retries per request.
    pub fn max_retries(mut self, count: u32) -> Self {
        self.max_retries = Some(count);
        self
    }

    /// Set the default per-request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the connect timeout for proxy clients.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Cap requests per second for each proxy in the pool.
    pub fn max_rps_per_proxy(mut self, rps: f64) -> Self {
        self.max_rps_per_proxy = Some(rps);
        self
    }

    /// Set the initial strategy by registry name.
    pub fn default_strategy(mut self, name: impl Into<String>) -> Self {
        self.default_strategy = Some(name.into());
        self
    }

    /// Set the per-proxy client cache size.
    pub fn client_cache_size(mut self, size: usize) -> Self {
        self.client_cache_size = Some(size);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RotatorConfig {
        RotatorConfig {
            max_retries: self.max_retries.unwrap_or(3),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(30)),
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(10)),
            max_rps_per_proxy: self.max_rps_per_proxy,
            default_strategy: self
                .default_strategy
                .unwrap_or_else(|| "round-robin".to_string()),
            client_cache_size: self.client_cache_size.unwrap_or(128),
        }
    }
}

impl Default for RotatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let config = RotatorConfig::builder().build();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_rps_per_proxy, None);
        assert_eq!(config.default_strategy, "round-robin");
        assert_eq!(config.client_cache_size, 128);
    }

    #[test]
    fn builder_overrides_stick() {
        let config = RotatorConfig::builder()
            .max_retries(1)
            .request_timeout(Duration::from_secs(5))
            .max_rps_per_proxy(3.0)
            .default_strategy("random")
            .client_cache_size(16)
            .build();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_rps_per_proxy, Some(3.0));
        assert_eq!(config.default_strategy, "random");
        assert_eq!(config.client_cache_size, 16);
    }
}
