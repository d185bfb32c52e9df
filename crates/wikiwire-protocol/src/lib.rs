//! # wikiwire-protocol - Protocol engine for MediaWiki-style action APIs
//!
//! This crate turns typed module inputs into HTTP round-trips against a wiki's
//! `api.php` endpoint and hands back merged, typed results. It covers the
//! parts of the API that are protocol rather than content: composing modules
//! into requests, continuation, tokens, outcome classification with retry,
//! and request pacing.
//!
//! ## Architecture Overview
//!
//! - **Request Builder** ([`RequestBuilder`]): merges one or more
//!   [`ModuleInput`]s sharing a [`PageSetSelector`] into one [`WireRequest`]
//! - **Continuation Engine** ([`QueryStream`]): issues rounds until the server
//!   runs dry or item caps are reached, merging per page into an
//!   [`AccumulatedResult`]
//! - **Token Manager** ([`TokenManager`]): fetches and caches tokens in the
//!   dialect of the connected server's [`ProtocolGeneration`]
//! - **Outcome Classifier** ([`Classifier`]) and [`RetryPolicy`]: success,
//!   warnings, lag, transient failure, token rejection, captcha, fatal error
//! - **Transport** ([`Transport`], [`HttpTransport`], [`PacedTransport`])
//! - **Client facade** ([`Client`])
//!
//! ## Protocol Generations
//!
//! Three incompatible dialects exist. The client detects the server version
//! once at connect time from `meta=siteinfo`:
//!
//! - **Legacy** (before 1.20): per-field token queries, `query-continue`
//! - **Transitional** (1.20 to 1.23): `action=tokens`, unified `continue`
//! - **Current** (1.24 and later): `meta=tokens`
//!
//! ## Usage Examples
//!
//! ### Listing a category
//!
//! ```rust,no_run
//! use wikiwire_protocol::{Client, ClientConfig, ModuleInput, PageSetSelector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("https://en.wikipedia.org/w/api.php");
//!     let client = Client::connect(config).await?;
//!
//!     let members = ModuleInput::list("categorymembers", "cm")
//!         .param("title", "Category:Physics")
//!         .batch_size(100)
//!         .max_items(250);
//!     let result = client.query(vec![members], PageSetSelector::None).collect().await?;
//!
//!     for title in result.data.list_titles("categorymembers") {
//!         println!("{title}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Editing a page
//!
//! ```rust,no_run
//! use wikiwire_protocol::{Client, ClientConfig, Credentials, ModuleInput, Outcome, TokenKind};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect(ClientConfig::from_env()?).await?;
//! client.login(&Credentials::new("ExampleBot", "secret")).await?;
//!
//! let edit = ModuleInput::action("edit")
//!     .param("title", "Sandbox")
//!     .param("appendtext", "\nHello")
//!     .param("summary", "test")
//!     .token(TokenKind::Csrf);
//!
//! match client.execute(&edit).await? {
//!     Outcome::NeedsChallenge(challenge) => {
//!         let answer = challenge.answer("solution typed by a human");
//!         client.execute_with_answer(&edit, &answer).await?;
//!     }
//!     outcome => println!("{:?}", outcome.warnings()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result`] with [`Error`]. Lag and transient
//! failures are retried inside the engine and only surface as
//! [`Error::Transient`] once the retry policy is exhausted. Server-reported
//! errors surface as [`Error::Api`] with the module, the attempted parameters
//! (secrets redacted) and the server's message.

pub mod client;
pub mod config;
pub mod continuation;
pub mod decode;
pub mod error;
pub mod module;
pub mod outcome;
pub mod request;
pub mod retry;
mod session;
pub mod site;
pub mod token;
pub mod transport;

// Re-export main types
pub use client::Client;
pub use config::{ClientConfig, PacingPolicy};
pub use continuation::{
    AccumulatedResult, ContinuationState, EntityKey, QueryResult, QueryStatus, QueryStream,
    RoundBatch,
};
pub use error::{Error, Result};
pub use module::{
    Capabilities, Limit, ModuleInput, ModuleKind, PageSetSelector, ParamValue, SelectorMode,
};
pub use outcome::{
    ApiResult, Challenge, ChallengeAnswer, Classifier, ItemError, Outcome, TransientReason, Warning,
};
pub use request::{BuildContext, HttpMethod, RequestBuilder, RequestClass, WireRequest};
pub use retry::{RetryDecision, RetryPolicy};
pub use session::{
    BOT_HIGH_LIMIT, Credentials, DEFAULT_HIGH_LIMIT, RequestInfo, RequestObserver, SessionHandle,
};
pub use site::{ProtocolGeneration, SiteInfo, SiteVersion};
pub use token::{Token, TokenKind, TokenManager, TokenScope, TokenSource};
pub use transport::{HttpConfig, HttpTransport, PacedTransport, RawResponse, Transport};
