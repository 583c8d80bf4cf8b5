//! # proxywhirl
//!
//! An HTTP proxy rotation engine.
//!
//! This library maintains a dynamic pool of outbound HTTP/HTTPS/SOCKS
//! proxies, selects one per request through a pluggable strategy, forwards
//! the request, tracks per-proxy health and performance, and evicts failing
//! proxies while fetching and validating replacements from external
//! sources. A sliding-window rate limiter gates callers in front of the
//! rotator.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod middleware;
pub mod monitor;
pub mod pool;
pub mod proxy;
pub mod ratelimit;
pub mod rotator;
pub mod secret;
pub mod store;
pub mod strategy;
pub mod transport;
pub mod validator;

pub use config::{RotatorConfig, RotatorConfigBuilder};
pub use error::{Error, ErrorKind, Result};
pub use fetcher::{FetchSource, Fetcher, ProxyCandidate, SourceFormat, SourceOutcome};
pub use middleware::RotatorMiddleware;
pub use monitor::{HealthMonitor, MonitorConfig, MonitorEvent, MonitorStatus, SweepSummary};
pub use pool::{PoolSummary, ProxyPool};
pub use proxy::{
    HealthState, Proxy, ProxyCredentials, ProxyEndpoint, ProxyId, ProxyScheme, ProxyStats,
    SourceTag,
};
pub use ratelimit::{
    Decision, FailMode, Identifier, InMemoryWindowStore, LimitRule, LimiterClock, ManualClock,
    MonotonicClock, RateLimitTier, RateLimiter, WindowStore,
};
#[cfg(feature = "redis-store")]
pub use ratelimit::RedisWindowStore;
pub use rotator::Rotator;
pub use secret::Secret;
pub use store::{MemoryStore, PoolSnapshot, ProxyRecord, Store};
pub use strategy::{
    CompositeConfig, CompositeStrategy, GeoTargeted, LeastUsed, Outcome, PerformanceBased,
    PerformanceConfig, Random, RotationStrategy, RoundRobin, SelectionContext,
    SessionPersistence, StrategyRegistry, ViewFilter, Weighted, WeightedConfig,
};
pub use transport::{
    ForwardRequest, ForwardResponse, ReqwestTransport, Transport, TransportError,
    TransportResponse,
};
pub use validator::{
    AnonymityLevel, ValidationLevel, ValidationResult, Validator, ValidatorConfig,
};
