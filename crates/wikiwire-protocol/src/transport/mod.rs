//! Transport layer
//!
//! A [`Transport`] sends one [`WireRequest`] and returns the raw response. The
//! HTTP implementation lives in [`http`]; [`pacing`] wraps any transport with
//! minimum read/write spacing.

mod http;
mod pacing;

pub use http::HttpTransport;
pub use pacing::PacedTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::request::WireRequest;

/// Status, lag hint and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, in seconds form only.
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

impl RawResponse {
    /// A 200 response with `body`.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// Sends wire requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &WireRequest) -> Result<RawResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, request: &WireRequest) -> Result<RawResponse> {
        (**self).send(request).await
    }
}

/// HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout
    pub timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Connection pool idle timeout
    pub pool_idle_timeout: Duration,

    /// Maximum idle connections per host
    pub pool_max_idle_per_host: usize,

    /// Enable compression (gzip, brotli, deflate)
    pub enable_compression: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 4,
            enable_compression: true,
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(default, Duration::from_secs)
        };
        Self {
            timeout: secs("WIKIWIRE_REQUEST_TIMEOUT", defaults.timeout),
            connect_timeout: secs("WIKIWIRE_CONNECT_TIMEOUT", defaults.connect_timeout),
            ..defaults
        }
    }
}

/// Install the ring crypto provider for rustls once per process.
pub(crate) fn ensure_crypto_provider() {
    // Fails only when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}
