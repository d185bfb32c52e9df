//! Token acquisition and caching
//!
//! Every write needs a token, and the way tokens are obtained differs per
//! [`ProtocolGeneration`]:
//!
//! | kind       | legacy                      | transitional    | current          |
//! |------------|-----------------------------|-----------------|------------------|
//! | edit-class | `prop=info&intoken=edit`    | `action=tokens` | `meta=tokens`    |
//! | watch      | `prop=info&intoken=watch`   | `action=tokens` | `meta=tokens`    |
//! | patrol     | `list=recentchanges&rctoken`| `action=tokens` | `meta=tokens`    |
//! | rollback   | `prop=revisions&rvtoken`    | as legacy       | `meta=tokens`    |
//! | userrights | `list=users&ustoken`        | as legacy       | `meta=tokens`    |
//! | login      | login handshake             | login handshake | `meta=tokens` \* |
//!
//! Legacy rollback tokens are scoped to a page and user, userrights tokens
//! to a user. Current servers hand out edit-class tokens as `csrf`.
//! \* from 1.27 on.
//!
//! On the two older generations one edit token serves block, delete, email,
//! import, move, protect, unblock, file revert and undelete as well.
//!
//! Tokens are cached until invalidated or the cache is cleared on login or
//! logout. The cache lock is held while a token is fetched, so concurrent
//! callers asking for the same kind trigger a single fetch.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::module::{ModuleInput, PageSetSelector};
use crate::outcome::ApiResult;
use crate::request::{BuildContext, RequestBuilder, WireRequest};
use crate::site::{ProtocolGeneration, SiteVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Csrf,
    Edit,
    Delete,
    Protect,
    Move,
    Block,
    Unblock,
    Email,
    Import,
    Undelete,
    FileRevert,
    Watch,
    Patrol,
    Rollback,
    UserRights,
    Login,
    CreateAccount,
}

impl TokenKind {
    pub const ALL: [Self; 17] = [
        Self::Csrf,
        Self::Edit,
        Self::Delete,
        Self::Protect,
        Self::Move,
        Self::Block,
        Self::Unblock,
        Self::Email,
        Self::Import,
        Self::Undelete,
        Self::FileRevert,
        Self::Watch,
        Self::Patrol,
        Self::Rollback,
        Self::UserRights,
        Self::Login,
        Self::CreateAccount,
    ];

    /// Kinds that share the edit token on older servers and the csrf token
    /// on current ones.
    pub fn is_edit_class(self) -> bool {
        matches!(
            self,
            Self::Csrf
                | Self::Edit
                | Self::Delete
                | Self::Protect
                | Self::Move
                | Self::Block
                | Self::Unblock
                | Self::Email
                | Self::Import
                | Self::Undelete
                | Self::FileRevert
        )
    }

    /// The kind actually fetched and cached for `self` on `generation`.
    pub fn canonical(self, generation: ProtocolGeneration) -> Self {
        match (self.is_edit_class(), generation) {
            (true, ProtocolGeneration::Current) => Self::Csrf,
            (true, _) => Self::Edit,
            (false, _) => self,
        }
    }

    /// Name used in token-type parameters and response fields.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Csrf => "csrf",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Protect => "protect",
            Self::Move => "move",
            Self::Block => "block",
            Self::Unblock => "unblock",
            Self::Email => "email",
            Self::Import => "import",
            Self::Undelete => "undelete",
            Self::FileRevert => "filerevert",
            Self::Watch => "watch",
            Self::Patrol => "patrol",
            Self::Rollback => "rollback",
            Self::UserRights => "userrights",
            Self::Login => "login",
            Self::CreateAccount => "createaccount",
        }
    }

    /// Whether older generations scope this kind to an entity.
    fn is_entity_scoped_on_older_servers(self) -> bool {
        matches!(self, Self::Rollback | Self::UserRights)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl std::str::FromStr for TokenKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.wire_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::configuration(format!("unknown token kind '{s}'")))
    }
}

/// What a token is valid for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenScope {
    Session,
    /// Per target user (user-rights changes).
    User(String),
    /// Per page and last editor (rollback).
    PageUser { page: String, user: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub scope: TokenScope,
    pub value: String,
    pub generation: ProtocolGeneration,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .field("value", &"[redacted]")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Issues token-fetch requests on behalf of the [`TokenManager`].
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token_response(&self, request: &WireRequest) -> Result<ApiResult>;
}

/// Where to find the token value in a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Extract {
    /// `query.pages[*].<kind>token`
    PageField(String),
    /// `query.recentchanges[0].patroltoken`
    RecentChange,
    /// `query.pages[*].revisions[0].rollbacktoken`
    RevisionField,
    /// `query.users[0].userrightstoken`
    UserField,
    /// `tokens.<kind>token`
    TokensAction(String),
    /// `query.tokens.<kind>token`
    MetaTokens(String),
}

/// A token fetch: the request to send and where to read the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub request: WireRequest,
    extract: Extract,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: TokenKind,
    scope: TokenScope,
}

/// Per-session token cache.
pub struct TokenManager {
    probe_title: String,
    cache: Mutex<HashMap<CacheKey, Token>>,
}

impl TokenManager {
    pub fn new(probe_title: impl Into<String>) -> Self {
        Self {
            probe_title: probe_title.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Scope a token of `kind` actually has on `generation`.
    pub fn effective_scope(
        kind: TokenKind,
        scope: TokenScope,
        generation: ProtocolGeneration,
    ) -> Result<TokenScope> {
        let entity_scoped = kind.is_entity_scoped_on_older_servers()
            && generation != ProtocolGeneration::Current;
        if !entity_scoped {
            return Ok(TokenScope::Session);
        }
        match (kind, &scope) {
            (TokenKind::Rollback, TokenScope::PageUser { .. })
            | (TokenKind::UserRights, TokenScope::User(_)) => Ok(scope),
            _ => Err(Error::token(
                kind,
                format!("{generation} servers scope {kind} tokens per entity; got {scope:?}"),
            )),
        }
    }

    /// Plan the request that fetches `kind` on `generation`.
    pub fn plan(
        &self,
        kind: TokenKind,
        scope: &TokenScope,
        generation: ProtocolGeneration,
        version: SiteVersion,
        ctx: &BuildContext,
    ) -> Result<FetchPlan> {
        let scope = Self::effective_scope(kind, scope.clone(), generation)?;
        let kind = kind.canonical(generation);
        let name = kind.wire_name();

        let (inputs, selector, extract) = match (generation, kind, &scope) {
            (ProtocolGeneration::Current, TokenKind::Login | TokenKind::CreateAccount, _)
                if !version.has_login_token_endpoint() =>
            {
                return Err(login_handshake_only(kind));
            }
            (ProtocolGeneration::Current, _, _) => (
                vec![ModuleInput::meta("tokens", "").param("type", name)],
                PageSetSelector::None,
                Extract::MetaTokens(name.to_string()),
            ),
            (_, TokenKind::Login | TokenKind::CreateAccount, _) => {
                return Err(login_handshake_only(kind));
            }
            (_, TokenKind::Rollback, TokenScope::PageUser { page, .. }) => (
                vec![
                    ModuleInput::prop("revisions", "rv")
                        .param("token", "rollback")
                        .param("prop", "user"),
                ],
                PageSetSelector::titles([page.clone()]),
                Extract::RevisionField,
            ),
            (_, TokenKind::UserRights, TokenScope::User(user)) => (
                vec![
                    ModuleInput::list("users", "us")
                        .param("users", user.as_str())
                        .param("token", "userrights"),
                ],
                PageSetSelector::None,
                Extract::UserField,
            ),
            (ProtocolGeneration::Transitional, _, _) => {
                let inputs = [ModuleInput::action("tokens").param("type", name)];
                let request = RequestBuilder::new(ctx, &inputs).build()?;
                return Ok(FetchPlan {
                    request,
                    extract: Extract::TokensAction(name.to_string()),
                });
            }
            (ProtocolGeneration::Legacy, TokenKind::Patrol, _) => (
                vec![
                    ModuleInput::list("recentchanges", "rc")
                        .param("token", "patrol")
                        .batch_size(1),
                ],
                PageSetSelector::None,
                Extract::RecentChange,
            ),
            (ProtocolGeneration::Legacy, _, _) => (
                vec![ModuleInput::prop("info", "in").param("token", name)],
                PageSetSelector::titles([self.probe_title.clone()]),
                Extract::PageField(name.to_string()),
            ),
        };

        let request = RequestBuilder::new(ctx, &inputs).selector(&selector).build()?;
        Ok(FetchPlan { request, extract })
    }

    /// Cached token for `kind`, fetching it through `source` on a miss.
    pub async fn get_token<S>(
        &self,
        kind: TokenKind,
        scope: TokenScope,
        generation: ProtocolGeneration,
        version: SiteVersion,
        ctx: &BuildContext,
        source: &S,
    ) -> Result<Token>
    where
        S: TokenSource + ?Sized,
    {
        let scope = Self::effective_scope(kind, scope, generation)?;
        let key = CacheKey {
            kind: kind.canonical(generation),
            scope: scope.clone(),
        };

        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.get(&key) {
            return Ok(Token {
                kind,
                ..token.clone()
            });
        }

        let plan = self.plan(kind, &scope, generation, version, ctx)?;
        debug!(
            "Fetching {} token via {} ({generation})",
            key.kind,
            plan.request.module_label()
        );
        let result = source.fetch_token_response(&plan.request).await?;
        let value = extract(&result, &plan.extract).ok_or_else(|| {
            Error::token(
                kind,
                format!("response to {} carried no token", plan.request.module_label()),
            )
        })?;

        let token = Token {
            kind: key.kind,
            scope,
            value,
            generation,
        };
        cache.insert(key, token.clone());
        Ok(Token { kind, ..token })
    }

    /// Drop every cached token of `kind` (all scopes).
    pub async fn invalidate(&self, kind: TokenKind, generation: ProtocolGeneration) {
        let canonical = kind.canonical(generation);
        let mut cache = self.cache.lock().await;
        cache.retain(|key, _| key.kind != canonical);
        debug!("Invalidated {canonical} tokens");
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.lock().await.len()
    }
}

fn login_handshake_only(kind: TokenKind) -> Error {
    Error::token(
        kind,
        "this server hands out login tokens only through the login handshake",
    )
}

fn extract(result: &ApiResult, how: &Extract) -> Option<String> {
    let field = |v: &Value, name: &str| {
        v.get(name)
            .and_then(Value::as_str)
            .map(ToString::to_string)
    };
    let pages = || {
        result
            .data
            .pointer("/query/pages")
            .map(crate::decode::page_objects)
            .unwrap_or_default()
    };
    let value = match how {
        Extract::PageField(kind) => pages()
            .into_iter()
            .find_map(|page| field(page, &format!("{kind}token"))),
        Extract::RecentChange => {
            field(result.data.pointer("/query/recentchanges/0")?, "patroltoken")
        }
        Extract::RevisionField => pages().into_iter().find_map(|page| {
            page.pointer("/revisions/0")
                .and_then(|rev| field(rev, "rollbacktoken"))
        }),
        Extract::UserField => field(result.data.pointer("/query/users/0")?, "userrightstoken"),
        Extract::TokensAction(kind) => field(result.data.get("tokens")?, &format!("{kind}token")),
        Extract::MetaTokens(kind) => {
            field(result.data.pointer("/query/tokens")?, &format!("{kind}token"))
        }
    };
    value.filter(|v| !v.is_empty())
}
