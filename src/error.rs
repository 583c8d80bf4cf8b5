//! Error types for the proxywhirl crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified transport-level failure observed while using a proxy.
///
/// Kinds carry no text so they can sit on a proxy's stat cell and travel in
/// error payloads without ever touching credential material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timed out establishing a connection to the proxy.
    ConnectTimeout,
    /// Connection to the proxy was refused or reset.
    ConnectError,
    /// Connection established but the response timed out.
    ReadTimeout,
    /// TLS negotiation through the proxy failed.
    TlsError,
    /// The proxy rejected our credentials (407).
    ProxyAuthFailed,
    /// The proxy itself told us to slow down.
    ProxyRateLimited,
    /// The proxy worked but could not reach the target origin.
    TargetUnreachable,
    /// The proxy worked but the target origin timed out.
    TargetTimeout,
    /// Anything we could not classify further.
    Other,
}

impl ErrorKind {
    /// Target-origin failures are not the proxy's fault; the rotator records
    /// them as successes on the proxy while still failing over.
    pub fn is_target_failure(self) -> bool {
        matches!(self, ErrorKind::TargetUnreachable | ErrorKind::TargetTimeout)
    }
}

/// Errors surfaced by the rotation engine.
///
/// Every variant maps to a stable code via [`Error::code`], forwarded
/// unchanged by the REST layer. Messages are redaction-safe: hosts, ports
/// and ids only, never credentials or raw identifiers.
#[derive(Debug, Error)]
pub enum Error {
    /// No proxy in the pool is eligible for selection.
    #[error("no proxies available for selection")]
    NoProxiesAvailable,

    /// Every attempted proxy failed at the transport level.
    #[error("all proxies failed after {attempts} attempts (last error: {last_error_kind:?})")]
    AllProxiesFailed {
        attempts: u32,
        last_error_kind: ErrorKind,
    },

    /// Every proxy reached the origin but the origin itself was unreachable.
    #[error("target origin unreachable through every proxy")]
    TargetUnreachable,

    /// The per-request deadline expired.
    #[error("request deadline exceeded")]
    RequestTimeout,

    /// Lookup by id or endpoint found nothing.
    #[error("proxy {0} not found in pool")]
    ProxyNotFound(String),

    /// Another pool entry already claims this `(host, port)`.
    #[error("proxy {host}:{port} already exists in pool")]
    DuplicateProxy { host: String, port: u16 },

    /// The pool's `max_size` would be exceeded.
    #[error("pool is full ({0} proxies)")]
    PoolFull(usize),

    /// A proxy endpoint or list entry could not be parsed.
    #[error("invalid proxy format: {0}")]
    InvalidProxyFormat(String),

    /// Authentication against the proxy failed.
    #[error("proxy authentication failed")]
    ProxyAuthFailed,

    /// The caller is rate limited.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// A validation probe could not be carried out at all.
    #[error("validation failed: {0}")]
    ValidationError(String),

    /// No strategy is registered under this name.
    #[error("unknown strategy {0:?}")]
    InvalidStrategy(String),

    /// The rate limiter's backing store could not be reached.
    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(String),
}

impl Error {
    /// Stable error code, surfaced unchanged to the REST layer.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NoProxiesAvailable => "PROXY_POOL_EMPTY",
            Error::AllProxiesFailed { .. } => "PROXY_FAILOVER_EXHAUSTED",
            Error::TargetUnreachable => "TARGET_UNREACHABLE",
            Error::RequestTimeout => "REQUEST_TIMEOUT",
            Error::ProxyNotFound(_) => "PROXY_NOT_FOUND",
            Error::DuplicateProxy { .. } => "PROXY_ALREADY_EXISTS",
            // The REST taxonomy has no pool-full code; the handler layer
            // reports it as a validation failure.
            Error::PoolFull(_) => "VALIDATION_ERROR",
            Error::InvalidProxyFormat(_) => "INVALID_PROXY_FORMAT",
            Error::ProxyAuthFailed => "PROXY_AUTH_FAILED",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::ValidationError(_) => "VALIDATION_ERROR",
            Error::InvalidStrategy(_) => "INVALID_STRATEGY",
            Error::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
