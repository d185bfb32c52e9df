//! Session state shared by every operation of a client
//!
//! A session owns the transport, the token cache, the detected site facts and
//! the per-session switches (`maxlag` support, high limits, login state). All
//! of it is safe to share between concurrent operations.

use async_trait::async_trait;
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::module::ModuleInput;
use crate::outcome::{ApiResult, ChallengeAnswer, Classifier, Outcome, TransientReason};
use crate::request::{BuildContext, HttpMethod, RequestBuilder, RequestClass, WireRequest};
use crate::retry::RetryDecision;
use crate::site::SiteInfo;
use crate::token::{Token, TokenKind, TokenManager, TokenScope, TokenSource};
use crate::transport::Transport;

/// Batch-size ceiling for ordinary accounts.
///
/// This is the server's standard `max` for list modules. It applies to every
/// module alike; per-module limits from `action=paraminfo` are not consulted.
pub const DEFAULT_HIGH_LIMIT: u32 = 500;
/// Batch-size ceiling for accounts holding `apihighlimits`, detected at login
/// through `meta=userinfo&uiprop=rights`.
pub const BOT_HIGH_LIMIT: u32 = 5000;

/// Metadata passed to the pre-send observer. Secrets are already redacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: HttpMethod,
    pub class: RequestClass,
    /// Module(s) addressed by the request.
    pub module: String,
    pub params: BTreeMap<String, String>,
    /// Retry number of this send within its operation, starting at 0.
    pub attempt: u32,
}

pub type RequestObserver = Arc<dyn Fn(&RequestInfo) + Send + Sync>;

/// Account credentials for [`crate::Client::login`].
#[derive(Debug, Clone)]
pub struct Credentials {
    pub name: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// The account a session is logged in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub user_name: String,
    pub user_id: u64,
    /// Whether the account may request batches up to [`BOT_HIGH_LIMIT`].
    pub high_limits: bool,
}

pub(crate) struct Session {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    classifier: Classifier,
    site: RwLock<SiteInfo>,
    lag_enabled: AtomicBool,
    high_limits: AtomicBool,
    logged_in: AtomicBool,
    tokens: TokenManager,
    observer: RwLock<Option<RequestObserver>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.config.endpoint)
            .field("site", &*self.site.read())
            .field("lag_enabled", &self.lag_enabled.load(Ordering::Relaxed))
            .field("logged_in", &self.logged_in.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let classifier = Classifier::new(config.retry_policy.default_lag_delay);
        let tokens = TokenManager::new(config.token_probe_title.clone());
        Self {
            config,
            transport,
            classifier,
            site: RwLock::new(SiteInfo::bootstrap()),
            lag_enabled: AtomicBool::new(false),
            high_limits: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            tokens,
            observer: RwLock::new(None),
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn site(&self) -> SiteInfo {
        self.site.read().clone()
    }

    pub(crate) fn lag_enabled(&self) -> bool {
        self.lag_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_observer(&self, observer: Option<RequestObserver>) {
        *self.observer.write() = observer;
    }

    /// Detect version, protocol generation and lag support. Runs once, before
    /// the session is handed to callers.
    pub(crate) async fn probe(&self) -> Result<SiteInfo> {
        let input = ModuleInput::meta("siteinfo", "si").param("prop", ["general", "dbrepllag"]);
        let ctx = self.build_context();
        let request = RequestBuilder::new(&ctx, slice::from_ref(&input)).build()?;
        let outcome = self.call(&request, &mut 0, &CancellationToken::new()).await?;
        let result = self.expect_result(outcome, &request)?;

        let info = SiteInfo::from_result(&result)?;
        let lag = info.lag_reporting && self.config.maxlag.is_some();
        self.lag_enabled.store(lag, Ordering::SeqCst);
        *self.site.write() = info.clone();

        info!(
            "Connected to {} (MediaWiki {}, {} protocol, maxlag {})",
            info.site_name.as_deref().unwrap_or(self.config.endpoint.as_str()),
            info.version,
            info.generation,
            if lag { "on" } else { "off" }
        );
        Ok(info)
    }

    pub(crate) fn build_context(&self) -> BuildContext {
        let site = self.site.read();
        BuildContext {
            generation: site.generation,
            high_limit: if self.high_limits.load(Ordering::SeqCst) {
                BOT_HIGH_LIMIT
            } else {
                DEFAULT_HIGH_LIMIT
            },
            maxlag: self.config.maxlag.filter(|_| self.lag_enabled()),
            format_v2: site.version.supports_format_v2(),
            assert_user: self.config.assert_user && self.logged_in.load(Ordering::SeqCst),
        }
    }

    fn notify(&self, request: &WireRequest, attempt: u32) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer(&RequestInfo {
                method: request.method(),
                class: request.class(),
                module: request.module_label(),
                params: request.redacted(),
                attempt,
            });
        }
    }

    /// One send: notify, transmit, classify.
    async fn send_once(
        &self,
        request: &WireRequest,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        self.notify(request, attempt);
        debug!(
            "{} {} (attempt {})",
            request.method(),
            request.module_label(),
            attempt + 1
        );

        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            sent = self.transport.send(request) => sent,
        };
        let raw = match sent {
            Ok(raw) => raw,
            Err(e) if e.should_retry() => {
                return Ok(Outcome::RetryableTransient(TransientReason::Transport(
                    e.to_string(),
                )));
            }
            Err(e) => return Err(e),
        };

        let outcome = self.classifier.classify_response(&raw)?;
        self.observe_warnings(&outcome);
        Ok(outcome)
    }

    fn observe_warnings(&self, outcome: &Outcome) {
        for warning in outcome.warnings() {
            if warning.message.contains("Unrecognized parameter")
                && warning.message.contains("maxlag")
                && self.lag_enabled.swap(false, Ordering::SeqCst)
            {
                warn!("Server does not support maxlag; disabling it for this session");
            } else {
                warn!("Server warning {warning}");
            }
        }
    }

    /// Send `request`, absorbing lag and transient failures per the retry
    /// policy. Returns the first outcome that is not retried here; a token
    /// rejection is returned as is for the caller to handle.
    ///
    /// `retries` counts the retries already spent by the operation the
    /// request belongs to; every call made for that operation shares it.
    pub(crate) async fn call(
        &self,
        request: &WireRequest,
        retries: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let policy = &self.config.retry_policy;
        loop {
            let attempt = *retries;
            let outcome = self.send_once(request, attempt, cancel).await?;
            let reason = match &outcome {
                Outcome::RetryableLag(delay) => {
                    format!("replication lag (server asks for {delay:?})")
                }
                Outcome::RetryableTransient(reason) if !is_token_rejection(reason) => {
                    reason.to_string()
                }
                _ => return Ok(outcome),
            };

            match policy.decide(&outcome, attempt, false) {
                RetryDecision::ProceedAfter(delay) => {
                    *retries += 1;
                    warn!(
                        "{} failed ({reason}); retry {}/{} in {delay:?}",
                        request.module_label(),
                        *retries,
                        policy.max_attempts
                    );
                    sleep(delay, cancel).await?;
                }
                RetryDecision::RefreshToken | RetryDecision::GiveUp => {
                    return Err(Error::Transient {
                        reason,
                        attempts: attempt + 1,
                    });
                }
            }
        }
    }

    pub(crate) fn api_error(&self, code: String, info: String, request: &WireRequest) -> Error {
        Error::Api {
            code,
            info,
            module: Some(request.module_label()),
            params: request.redacted(),
        }
    }

    /// Result of a successful outcome, or the matching error.
    pub(crate) fn expect_result(
        &self,
        outcome: Outcome,
        request: &WireRequest,
    ) -> Result<ApiResult> {
        match outcome {
            Outcome::Success(result) | Outcome::SuccessWithWarnings(result, _) => Ok(result),
            Outcome::Fatal { code, info } => Err(self.api_error(code, info, request)),
            Outcome::NeedsChallenge(challenge) => Err(Error::ChallengeRequired(challenge)),
            Outcome::RetryableTransient(TransientReason::TokenRejected { code, info }) => {
                Err(self.api_error(code, info, request))
            }
            Outcome::RetryableLag(_) | Outcome::RetryableTransient(_) => Err(Error::Transient {
                reason: "retryable outcome escaped the retry loop".to_string(),
                attempts: 1,
            }),
        }
    }

    pub(crate) async fn token(&self, kind: TokenKind, scope: TokenScope) -> Result<Token> {
        let site = self.site();
        let ctx = self.build_context();
        self.tokens
            .get_token(kind, scope, site.generation, site.version, &ctx, self)
            .await
    }

    pub(crate) async fn invalidate_token(&self, kind: TokenKind) {
        let generation = self.site.read().generation;
        self.tokens.invalidate(kind, generation).await;
    }

    /// Run one write (or any action) module, refreshing its token at most
    /// once.
    pub(crate) async fn execute(
        &self,
        input: &ModuleInput,
        answer: Option<&ChallengeAnswer>,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let requirement = input.token_requirement().cloned();
        let mut refreshed = false;
        let mut retries = 0;

        loop {
            let token = match &requirement {
                Some(req) => Some(self.token(req.kind, req.scope.clone()).await?),
                None => None,
            };
            let ctx = self.build_context();
            let mut request = RequestBuilder::new(&ctx, slice::from_ref(input))
                .token(token.as_ref())
                .build()?;
            if let Some(answer) = answer {
                request.set("captchaid", answer.id.clone());
                request.set("captchaword", answer.word.clone());
            }

            let outcome = self.call(&request, &mut retries, cancel).await?;
            match outcome {
                Outcome::RetryableTransient(TransientReason::TokenRejected { code, info }) => {
                    let Some(req) = &requirement else {
                        return Err(self.api_error(code, info, &request));
                    };
                    let rejected = Outcome::RetryableTransient(TransientReason::TokenRejected {
                        code: code.clone(),
                        info: info.clone(),
                    });
                    match self.config.retry_policy.decide(&rejected, 0, refreshed) {
                        RetryDecision::RefreshToken => {
                            warn!("{} token rejected ({code}); refreshing", req.kind);
                            self.invalidate_token(req.kind).await;
                            refreshed = true;
                        }
                        _ => return Err(self.api_error(code, info, &request)),
                    }
                }
                Outcome::Fatal { code, info } => return Err(self.api_error(code, info, &request)),
                other => return Ok(other),
            }
        }
    }

    pub(crate) async fn login(&self, credentials: &Credentials) -> Result<SessionHandle> {
        let site = self.site();
        let cancel = CancellationToken::new();
        let mut retries = 0;
        let mut lgtoken = if site.version.has_login_token_endpoint() {
            Some(self.token(TokenKind::Login, TokenScope::Session).await?.value)
        } else {
            None
        };

        let mut handshake_done = false;
        let (user_name, user_id) = loop {
            let mut input = ModuleInput::action("login")
                .post()
                .param("lgname", credentials.name.as_str())
                .param("lgpassword", credentials.password.expose_secret());
            if let Some(token) = &lgtoken {
                input = input.param("lgtoken", token.as_str());
            }
            let ctx = self.build_context();
            let request = RequestBuilder::new(&ctx, slice::from_ref(&input)).build()?;
            let outcome = self.call(&request, &mut retries, &cancel).await?;
            let result = self.expect_result(outcome, &request)?;
            let login = result.module("login").cloned().unwrap_or(Value::Null);

            match login.get("result").and_then(Value::as_str) {
                Some("Success") => {
                    let name = login
                        .get("lgusername")
                        .and_then(Value::as_str)
                        .unwrap_or(credentials.name.as_str())
                        .to_string();
                    let id = login.get("lguserid").and_then(Value::as_u64).unwrap_or(0);
                    break (name, id);
                }
                Some("NeedToken") if !handshake_done => {
                    let token = login.get("token").and_then(Value::as_str).ok_or_else(|| {
                        Error::protocol(
                            "NeedToken response without a token",
                            login.to_string().as_bytes(),
                        )
                    })?;
                    lgtoken = Some(token.to_string());
                    handshake_done = true;
                }
                Some(code) => {
                    let info = crate::decode::text_field(&login, "reason").unwrap_or_default();
                    return Err(self.api_error(code.to_string(), info, &request));
                }
                None => {
                    return Err(Error::protocol(
                        "login response lacks a result",
                        result.data.to_string().as_bytes(),
                    ));
                }
            }
        };

        self.tokens.clear().await;
        self.logged_in.store(true, Ordering::SeqCst);
        let high_limits = self.fetch_high_limits(&mut retries, &cancel).await?;
        self.high_limits.store(high_limits, Ordering::SeqCst);

        info!("Logged in as {user_name} (high limits: {high_limits})");
        Ok(SessionHandle {
            user_name,
            user_id,
            high_limits,
        })
    }

    async fn fetch_high_limits(
        &self,
        retries: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let input = ModuleInput::meta("userinfo", "ui").param("prop", "rights");
        let ctx = self.build_context();
        let request = RequestBuilder::new(&ctx, slice::from_ref(&input)).build()?;
        let outcome = self.call(&request, retries, cancel).await?;
        let result = self.expect_result(outcome, &request)?;
        Ok(result
            .data
            .pointer("/query/userinfo/rights")
            .and_then(Value::as_array)
            .is_some_and(|rights| rights.iter().any(|r| r.as_str() == Some("apihighlimits"))))
    }

    pub(crate) async fn logout(&self) -> Result<()> {
        let mut input = ModuleInput::action("logout").post();
        if self.site().generation == crate::site::ProtocolGeneration::Current {
            input = input.token(TokenKind::Csrf);
        }
        self.execute(&input, None, &CancellationToken::new()).await?;

        self.tokens.clear().await;
        self.logged_in.store(false, Ordering::SeqCst);
        self.high_limits.store(false, Ordering::SeqCst);
        info!("Logged out");
        Ok(())
    }
}

#[async_trait]
impl TokenSource for Session {
    async fn fetch_token_response(&self, request: &WireRequest) -> Result<ApiResult> {
        let outcome = self.call(request, &mut 0, &CancellationToken::new()).await?;
        self.expect_result(outcome, request)
    }
}

fn is_token_rejection(reason: &TransientReason) -> bool {
    matches!(reason, TransientReason::TokenRejected { .. })
}

/// Sleep for `delay` unless cancelled first.
pub(crate) async fn sleep(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}
