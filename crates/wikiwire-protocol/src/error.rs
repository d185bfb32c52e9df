//! Error types for protocol operations

use std::collections::BTreeMap;
use thiserror::Error;

use crate::outcome::Challenge;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller composed a request the engine refuses to send.
    #[error("Invalid request: {0}")]
    Configuration(String),

    /// The server answered with something that is not a recognisable API
    /// response. Usually means a server-version mismatch.
    #[error("Unexpected response: {message}")]
    Protocol {
        message: String,
        /// Raw response body (truncated) kept for diagnosis
        payload: String,
    },

    #[error("Transient failure after {attempts} attempt(s): {reason}")]
    Transient { reason: String, attempts: u32 },

    #[error("Token error ({kind}): {reason}")]
    Token { kind: String, reason: String },

    #[error("API error {code}: {info}")]
    Api {
        code: String,
        info: String,
        /// Module the failing request addressed (`action`, or query submodules)
        module: Option<String>,
        /// Attempted parameters with secret values redacted
        params: BTreeMap<String, String>,
    },

    #[error("Human verification required ({})", .0.kind)]
    ChallengeRequired(Challenge),

    #[error("Continuation did not finish within {rounds} rounds")]
    ProtocolExhausted { rounds: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Check if error is retryable
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn protocol(message: impl Into<String>, payload: &[u8]) -> Self {
        const MAX_PAYLOAD: usize = 2048;
        let end = payload.len().min(MAX_PAYLOAD);
        Self::Protocol {
            message: message.into(),
            payload: String::from_utf8_lossy(&payload[..end]).into_owned(),
        }
    }

    pub(crate) fn token(kind: impl ToString, reason: impl Into<String>) -> Self {
        Self::Token {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }

    /// Server-reported error code, if this error carries one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
