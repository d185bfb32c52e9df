//! Outcome classification
//!
//! Every response is classified exactly once into an [`Outcome`]. The
//! classifier never retries anything itself; [`crate::retry::RetryPolicy`]
//! decides what to do with retryable outcomes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::decode::{self, DecodedResponse, RawContinuation};
use crate::error::{Error, Result};
use crate::transport::RawResponse;

/// Error codes resolved by fetching a fresh token and retrying once.
pub const TOKEN_ERROR_CODES: &[&str] = &["badtoken", "notoken-expired", "sessionfailure"];

/// Error codes that indicate a temporary server condition.
pub const TRANSIENT_ERROR_CODES: &[&str] = &[
    "readonly",
    "ratelimited",
    "internal_api_error_DBConnectionError",
    "internal_api_error_DBQueryError",
    "internal_api_error_DBQueryTimeoutError",
];

/// A server warning attached to a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Module that emitted the warning (`main` for request-level ones).
    pub module: String,
    pub code: Option<String>,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.module, self.message)
    }
}

/// An error reported for one item of a batch result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub code: String,
    pub info: String,
    /// Title or id of the failing item, when the server names it.
    pub item: Option<String>,
}

/// Result data of one successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResult {
    /// Result tree without envelope keys.
    pub data: Value,
    pub continuation: Option<RawContinuation>,
    pub batch_complete: bool,
    pub item_errors: Vec<ItemError>,
}

impl ApiResult {
    /// Build from a complete response body, splitting off envelope keys.
    pub fn from_value(value: Value) -> Self {
        let body = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        let parts = decode::split_body(body);
        Self {
            data: parts.data,
            continuation: parts.continuation,
            batch_complete: parts.batch_complete,
            item_errors: parts.item_errors,
        }
    }

    /// Object returned for a top-level module, e.g. `edit` or `login`.
    pub fn module(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// `result` field of a write module's response (`Success`, `Failure`, ...).
    pub fn module_result(&self, name: &str) -> Option<&str> {
        self.module(name)?.get("result")?.as_str()
    }
}

/// A human-verification challenge issued on a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Module whose response carried the challenge.
    pub module: String,
    pub id: String,
    /// `image`, `question`, `simple`, ...
    pub kind: String,
    pub mime: Option<String>,
    pub question: Option<String>,
    pub url: Option<String>,
}

impl Challenge {
    fn from_value(module: &str, captcha: &Value) -> Option<Self> {
        let text = |name| decode::text_field(captcha, name);
        Some(Self {
            module: module.to_string(),
            id: text("id")?,
            kind: text("type").unwrap_or_else(|| "unknown".to_string()),
            mime: text("mime"),
            question: text("question"),
            url: text("url"),
        })
    }

    /// Pair this challenge with the caller's solution.
    pub fn answer(&self, word: impl Into<String>) -> ChallengeAnswer {
        ChallengeAnswer {
            id: self.id.clone(),
            word: word.into(),
        }
    }
}

/// A caller-supplied challenge solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeAnswer {
    pub id: String,
    pub word: String,
}

/// Why a retryable failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientReason {
    /// Timeout, connection reset and similar.
    Transport(String),
    /// HTTP 429 or 5xx.
    HttpStatus(u16),
    /// Server-reported temporary condition such as `readonly`.
    ServerBusy { code: String, info: String },
    /// The token sent with the request was rejected.
    TokenRejected { code: String, info: String },
}

impl fmt::Display for TransientReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(message) => write!(f, "transport failure: {message}"),
            Self::HttpStatus(status) => write!(f, "HTTP status {status}"),
            Self::ServerBusy { code, info } => write!(f, "{code}: {info}"),
            Self::TokenRejected { code, info } => write!(f, "token rejected ({code}): {info}"),
        }
    }
}

/// Classification of one response.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ApiResult),
    SuccessWithWarnings(ApiResult, Vec<Warning>),
    RetryableLag(Duration),
    RetryableTransient(TransientReason),
    Fatal { code: String, info: String },
    NeedsChallenge(Challenge),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_) | Self::SuccessWithWarnings(..))
    }

    pub fn result(&self) -> Option<&ApiResult> {
        match self {
            Self::Success(result) | Self::SuccessWithWarnings(result, _) => Some(result),
            _ => None,
        }
    }

    pub fn into_result(self) -> Option<ApiResult> {
        match self {
            Self::Success(result) | Self::SuccessWithWarnings(result, _) => Some(result),
            _ => None,
        }
    }

    pub fn warnings(&self) -> &[Warning] {
        match self {
            Self::SuccessWithWarnings(_, warnings) => warnings,
            _ => &[],
        }
    }
}

/// Turns decoded responses into [`Outcome`]s.
#[derive(Debug, Clone)]
pub struct Classifier {
    token_codes: Vec<String>,
    transient_codes: Vec<String>,
    default_lag_delay: Duration,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Classifier {
    pub fn new(default_lag_delay: Duration) -> Self {
        Self {
            token_codes: TOKEN_ERROR_CODES.iter().map(ToString::to_string).collect(),
            transient_codes: TRANSIENT_ERROR_CODES.iter().map(ToString::to_string).collect(),
            default_lag_delay,
        }
    }

    /// Add a code to the refresh-token-and-retry allow-list.
    #[must_use]
    pub fn with_token_code(mut self, code: &str) -> Self {
        self.token_codes.push(code.to_string());
        self
    }

    /// Decode and classify a raw response.
    ///
    /// Undecodable bodies are retryable when the HTTP status says the server
    /// is overloaded, and a [`Error::Protocol`] otherwise.
    pub fn classify_response(&self, raw: &RawResponse) -> Result<Outcome> {
        let overloaded = raw.status == 429 || raw.status >= 500;
        let decoded = match decode::decode(raw) {
            Ok(decoded) => decoded,
            Err(_) if overloaded => {
                return Ok(Outcome::RetryableTransient(TransientReason::HttpStatus(
                    raw.status,
                )));
            }
            Err(e) => return Err(e),
        };

        if decoded.errors.is_empty() {
            if overloaded {
                return Ok(Outcome::RetryableTransient(TransientReason::HttpStatus(
                    raw.status,
                )));
            }
            if !(200..300).contains(&raw.status) {
                return Err(Error::protocol(
                    format!("unexpected HTTP status {}", raw.status),
                    &raw.body,
                ));
            }
        }
        Ok(self.classify(decoded))
    }

    /// Classify an already decoded response.
    pub fn classify(&self, decoded: DecodedResponse) -> Outcome {
        if let Some(error) = decoded.errors.first() {
            let code = error.code.clone();
            let info = error.info.clone();
            if code == "maxlag" {
                return Outcome::RetryableLag(decoded.retry_after.unwrap_or(self.default_lag_delay));
            }
            if self.token_codes.contains(&code) {
                return Outcome::RetryableTransient(TransientReason::TokenRejected { code, info });
            }
            if self.transient_codes.contains(&code) {
                return Outcome::RetryableTransient(TransientReason::ServerBusy { code, info });
            }
            return Outcome::Fatal { code, info };
        }

        if let Some(outcome) = classify_module_results(&decoded.data) {
            return outcome;
        }

        let mut warnings = decoded.warnings;
        warnings.extend(decoded.item_errors.iter().map(|e| Warning {
            module: "item".to_string(),
            code: Some(e.code.clone()),
            message: match &e.item {
                Some(item) => format!("{item}: {}", e.info),
                None => e.info.clone(),
            },
        }));

        let result = ApiResult {
            data: decoded.data,
            continuation: decoded.continuation,
            batch_complete: decoded.batch_complete,
            item_errors: decoded.item_errors,
        };
        if warnings.is_empty() {
            Outcome::Success(result)
        } else {
            Outcome::SuccessWithWarnings(result, warnings)
        }
    }
}

/// Challenges and `result: Failure` objects returned by write modules.
fn classify_module_results(data: &Value) -> Option<Outcome> {
    let modules = data.as_object()?;
    for (module, value) in modules {
        if module == "query" {
            continue;
        }
        if let Some(captcha) = value.get("captcha")
            && let Some(challenge) = Challenge::from_value(module, captcha)
        {
            return Some(Outcome::NeedsChallenge(challenge));
        }
        if value.get("result").and_then(Value::as_str) == Some("Failure") {
            let detail = value
                .as_object()
                .and_then(|o| o.keys().find(|k| k.as_str() != "result").cloned());
            let code = detail.clone().unwrap_or_else(|| "failure".to_string());
            let info = detail
                .and_then(|k| decode::text_field(value, &k))
                .unwrap_or_else(|| value.to_string());
            return Some(Outcome::Fatal { code, info });
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn response(status: u16, retry_after: Option<u64>, body: &Value) -> RawResponse {
        RawResponse {
            status,
            retry_after: retry_after.map(Duration::from_secs),
            body: Bytes::from(body.to_string()),
        }
    }

    fn classify(body: &Value) -> Outcome {
        Classifier::default()
            .classify_response(&response(200, None, body))
            .expect("response should classify")
    }

    #[test]
    fn test_plain_success() {
        let outcome = classify(&json!({"batchcomplete": "", "query": {"allpages": []}}));
        assert!(matches!(outcome, Outcome::Success(_)));
    }

    #[test]
    fn test_warnings_never_block_success() {
        let outcome = classify(&json!({
            "warnings": {"revisions": {
                "*": "Because \"rvslots\" was not specified, a legacy format has been used"
            }},
            "query": {"pages": {
                "1": {"pageid": 1, "title": "Foo", "revisions": [{"revid": 7}]}
            }}
        }));
        match outcome {
            Outcome::SuccessWithWarnings(result, warnings) => {
                assert_eq!(warnings.len(), 1);
                assert_eq!(warnings[0].module, "revisions");
                assert_eq!(
                    result.data.pointer("/query/pages/1/revisions/0/revid"),
                    Some(&json!(7))
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_maxlag_uses_retry_after_or_default() {
        let body = json!({"error": {
            "code": "maxlag",
            "info": "Waiting for db1: 8 seconds lagged",
            "lag": 8
        }});
        let classifier = Classifier::new(Duration::from_secs(3));
        let outcome = classifier
            .classify_response(&response(200, Some(11), &body))
            .unwrap();
        assert_eq!(outcome, Outcome::RetryableLag(Duration::from_secs(11)));

        let outcome = classifier.classify_response(&response(503, None, &body)).unwrap();
        assert_eq!(outcome, Outcome::RetryableLag(Duration::from_secs(3)));
    }

    #[test]
    fn test_token_and_fatal_codes() {
        let error = |code: &str, info: &str| json!({"error": {"code": code, "info": info}});
        let outcome = classify(&error("badtoken", "Invalid CSRF token."));
        assert!(matches!(
            outcome,
            Outcome::RetryableTransient(TransientReason::TokenRejected { .. })
        ));

        let outcome = classify(&error("protectedpage", "This page has been protected."));
        assert_eq!(
            outcome,
            Outcome::Fatal {
                code: "protectedpage".to_string(),
                info: "This page has been protected.".to_string()
            }
        );

        let outcome = classify(&error("readonly", "The wiki is in read-only mode."));
        assert!(matches!(
            outcome,
            Outcome::RetryableTransient(TransientReason::ServerBusy { .. })
        ));
    }

    #[test]
    fn test_captcha_needs_challenge() {
        let outcome = classify(&json!({
            "edit": {
                "result": "Failure",
                "captcha": {
                    "type": "image",
                    "mime": "image/png",
                    "id": "4212",
                    "url": "/w/index.php?title=Special:Captcha/image&wpCaptchaId=4212"
                }
            }
        }));
        match outcome {
            Outcome::NeedsChallenge(challenge) => {
                assert_eq!(challenge.module, "edit");
                assert_eq!(challenge.id, "4212");
                assert_eq!(challenge.kind, "image");
                assert_eq!(challenge.answer("sunflower").word, "sunflower");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_action_failure_without_captcha_is_fatal() {
        let outcome = classify(&json!({
            "edit": {"result": "Failure", "spamblacklist": "example.com"}
        }));
        assert_eq!(
            outcome,
            Outcome::Fatal {
                code: "spamblacklist".to_string(),
                info: "example.com".to_string()
            }
        );
    }

    #[test]
    fn test_item_errors_become_warnings() {
        let outcome = classify(&json!({
            "watch": [
                {"title": "Foo", "watched": ""},
                {"title": "<bad>", "error": {"code": "invalidtitle", "info": "Bad title"}}
            ]
        }));
        match outcome {
            Outcome::SuccessWithWarnings(result, warnings) => {
                assert_eq!(result.item_errors.len(), 1);
                assert_eq!(warnings[0].code.as_deref(), Some("invalidtitle"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_http_failures() {
        let classifier = Classifier::default();
        let busy = RawResponse {
            status: 502,
            retry_after: None,
            body: Bytes::from_static(b"<html>Bad gateway</html>"),
        };
        assert_eq!(
            classifier.classify_response(&busy).unwrap(),
            Outcome::RetryableTransient(TransientReason::HttpStatus(502))
        );

        let missing = RawResponse {
            status: 404,
            retry_after: None,
            body: Bytes::from_static(b"{}"),
        };
        assert!(matches!(
            classifier.classify_response(&missing),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_api_result_from_value_strips_envelope() {
        let result = ApiResult::from_value(json!({
            "login": {"result": "NeedToken", "token": "abc"},
            "warnings": {"main": {"*": "x"}}
        }));
        assert_eq!(result.module_result("login"), Some("NeedToken"));
        assert!(result.data.get("warnings").is_none());
    }
}
