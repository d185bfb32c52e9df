//! Configuration structures for API clients

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::transport::HttpConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API endpoint URL (`.../api.php`)
    pub endpoint: String,

    /// User agent sent with every request
    pub user_agent: String,

    /// `maxlag` in seconds; `None` never sends it
    pub maxlag: Option<u32>,

    /// Minimum spacing between requests
    pub pacing: PacingPolicy,

    /// Retry policy for lag and transient failures
    pub retry_policy: RetryPolicy,

    /// Continuation round ceiling per query
    pub max_rounds: usize,

    /// HTTP client settings
    pub http: HttpConfig,

    /// Page used by old servers' per-field token queries
    pub token_probe_title: String,

    /// Send `assert=user` on writes once logged in
    pub assert_user: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost/w/api.php".to_string(),
            user_agent: default_user_agent(),
            maxlag: Some(5),
            pacing: PacingPolicy::default(),
            retry_policy: RetryPolicy::default(),
            max_rounds: 1000,
            http: HttpConfig::default(),
            token_probe_title: "Main Page".to_string(),
            assert_user: true,
        }
    }
}

impl ClientConfig {
    /// Configuration for `endpoint` with all other settings defaulted.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let maxlag = match std::env::var("WIKIWIRE_MAXLAG") {
            Ok(value) if value == "off" || value.is_empty() => None,
            Ok(value) => Some(value.parse().map_err(|_| {
                Error::configuration(format!("WIKIWIRE_MAXLAG is not a number: {value}"))
            })?),
            Err(_) => defaults.maxlag,
        };

        let config = Self {
            endpoint: std::env::var("WIKIWIRE_ENDPOINT").unwrap_or(defaults.endpoint),
            user_agent: std::env::var("WIKIWIRE_USER_AGENT").unwrap_or(defaults.user_agent),
            maxlag,
            pacing: PacingPolicy::from_env(),
            retry_policy: RetryPolicy::from_env()?,
            max_rounds: std::env::var("WIKIWIRE_MAX_ROUNDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_rounds),
            http: HttpConfig::from_env(),
            token_probe_title: std::env::var("WIKIWIRE_TOKEN_PROBE_TITLE")
                .unwrap_or(defaults.token_probe_title),
            assert_user: std::env::var("WIKIWIRE_ASSERT_USER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.assert_user),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.endpoint)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::configuration(format!(
                "endpoint must be http(s): {}",
                self.endpoint
            )));
        }
        if self.max_rounds == 0 {
            return Err(Error::configuration("max_rounds must be positive"));
        }
        Ok(())
    }
}

fn default_user_agent() -> String {
    format!("wikiwire/{}", env!("CARGO_PKG_VERSION"))
}

/// Minimum delay since the last request of the same class. Zero disables
/// pacing for that class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingPolicy {
    pub read_interval: Duration,
    pub write_interval: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            read_interval: Duration::ZERO,
            write_interval: Duration::from_secs(2),
        }
    }
}

impl PacingPolicy {
    pub const fn disabled() -> Self {
        Self {
            read_interval: Duration::ZERO,
            write_interval: Duration::ZERO,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(default, Duration::from_millis)
        };
        Self {
            read_interval: millis("WIKIWIRE_READ_INTERVAL_MS", defaults.read_interval),
            write_interval: millis("WIKIWIRE_WRITE_INTERVAL_MS", defaults.write_interval),
        }
    }
}
