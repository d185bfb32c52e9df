//! Client facade

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::continuation::QueryStream;
use crate::error::{Error, Result};
use crate::module::{ModuleInput, ModuleKind, PageSetSelector};
use crate::outcome::{ChallengeAnswer, Outcome};
use crate::session::{Credentials, RequestInfo, Session, SessionHandle};
use crate::site::{ProtocolGeneration, SiteInfo};
use crate::token::{Token, TokenKind, TokenScope};
use crate::transport::{HttpTransport, PacedTransport, Transport};

/// Entry point for callers: queries, writes, login.
///
/// Cloning is cheap; clones share the session (token cache, pacing state,
/// cookies).
#[derive(Debug, Clone)]
pub struct Client {
    session: Arc<Session>,
}

impl Client {
    /// Connect over HTTP and probe the server.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(&config.endpoint, &config.user_agent, &config.http)?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Connect over a caller-supplied transport. Pacing from `config` is
    /// applied on top of it.
    pub async fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let paced = PacedTransport::new(transport, config.pacing);
        let session = Arc::new(Session::new(config, Arc::new(paced)));
        session.probe().await?;
        Ok(Self { session })
    }

    pub fn site(&self) -> SiteInfo {
        self.session.site()
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.session.site().generation
    }

    pub fn config(&self) -> &ClientConfig {
        self.session.config()
    }

    /// Whether `maxlag` is currently sent with requests.
    pub fn lag_checking(&self) -> bool {
        self.session.lag_enabled()
    }

    /// Install the pre-send observer, replacing any previous one.
    pub fn on_request<F>(&self, observer: F)
    where
        F: Fn(&RequestInfo) + Send + Sync + 'static,
    {
        self.session.set_observer(Some(Arc::new(observer)));
    }

    pub fn clear_request_observer(&self) {
        self.session.set_observer(None);
    }

    /// Start a read query over `selector`.
    pub fn query(&self, inputs: Vec<ModuleInput>, selector: PageSetSelector) -> QueryStream {
        self.query_with_cancel(inputs, selector, CancellationToken::new())
    }

    pub fn query_with_cancel(
        &self,
        inputs: Vec<ModuleInput>,
        selector: PageSetSelector,
        cancel: CancellationToken,
    ) -> QueryStream {
        QueryStream::new(Arc::clone(&self.session), inputs, selector, cancel)
    }

    /// Run one write module.
    ///
    /// Returns `Success`, `SuccessWithWarnings` or `NeedsChallenge`; every
    /// other outcome surfaces as an error.
    pub async fn execute(&self, input: &ModuleInput) -> Result<Outcome> {
        self.execute_inner(input, None, &CancellationToken::new()).await
    }

    /// Re-submit a write with the solution to a challenge it returned.
    pub async fn execute_with_answer(
        &self,
        input: &ModuleInput,
        answer: &ChallengeAnswer,
    ) -> Result<Outcome> {
        self.execute_inner(input, Some(answer), &CancellationToken::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        input: &ModuleInput,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        self.execute_inner(input, None, cancel).await
    }

    async fn execute_inner(
        &self,
        input: &ModuleInput,
        answer: Option<&ChallengeAnswer>,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if input.kind() != ModuleKind::Action {
            return Err(Error::configuration(format!(
                "'{}' is not an action module; use query()",
                input.name()
            )));
        }
        self.session.execute(input, answer, cancel).await
    }

    /// A token of `kind`, from cache when possible.
    pub async fn token(&self, kind: TokenKind, scope: TokenScope) -> Result<Token> {
        self.session.token(kind, scope).await
    }

    pub async fn invalidate_token(&self, kind: TokenKind) {
        self.session.invalidate_token(kind).await;
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<SessionHandle> {
        self.session.login(credentials).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.session.logout().await
    }
}
