//! In-process fake of a wiki API endpoint for integration tests
//!
//! Speaks enough of the three protocol generations to exercise the client:
//! siteinfo, categorymembers (as list and generator), prop=info and
//! prop=categories, every token dialect, edit, login and logout. Faults such
//! as replication lag and token rejection can be injected per test.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use wikiwire_protocol::{
    ClientConfig, PacingPolicy, RawResponse, Result, RetryPolicy, Transport, WireRequest,
};

pub const ENDPOINT: &str = "https://wiki.test/w/api.php";
pub const LEGACY: &str = "MediaWiki 1.19.24";
pub const TRANSITIONAL: &str = "MediaWiki 1.23.17";
pub const CURRENT: &str = "MediaWiki 1.35.0";

const CATEGORIES: [&str; 3] = ["Category:Alpha", "Category:Beta", "Category:Gamma"];
const HANDSHAKE_TOKEN: &str = "handshake0123";

/// Mutable server state and fault switches.
#[derive(Debug, Default)]
pub struct WikiState {
    pub requests: Vec<WireRequest>,
    pub members: Vec<String>,
    /// Rights reported by `meta=userinfo`.
    pub rights: Vec<String>,
    /// Respond with `maxlag` to this many requests carrying `maxlag`.
    pub lag_errors: usize,
    pub lag_retry_after: Option<Duration>,
    /// Reject this many writes with `badtoken` regardless of the token.
    pub bad_tokens: usize,
    /// Answer `maxlag` with an "Unrecognized parameter" warning.
    pub unknown_maxlag: bool,
    /// Warning attached to every query response.
    pub query_warning: Option<String>,
    /// Require a captcha answer on edits.
    pub captcha: bool,
    /// Fail `list=categorymembers` once it has been served this many times.
    pub fail_list_after: Option<usize>,
    list_served: usize,
    token_serial: usize,
    valid_token: Option<String>,
    pub logged_in: bool,
}

pub struct FakeWiki {
    generator: String,
    pub state: Mutex<WikiState>,
}

impl FakeWiki {
    pub fn new(generator: &str) -> Arc<Self> {
        Arc::new(Self {
            generator: generator.to_string(),
            state: Mutex::new(WikiState::default()),
        })
    }

    /// A wiki whose `Category:Test` holds `count` pages named `Page 0`, ...
    pub fn with_members(generator: &str, count: usize) -> Arc<Self> {
        let wiki = Self::new(generator);
        wiki.state.lock().members = (0..count).map(|i| format!("Page {i}")).collect();
        wiki
    }

    pub fn requests(&self) -> Vec<WireRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests matching `param=value`.
    pub fn requests_with(&self, param: &str, value: &str) -> Vec<WireRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.get(param) == Some(value))
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().requests.clear();
    }

    fn respond(&self, request: &WireRequest) -> RawResponse {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        let fv2 = request.get("formatversion") == Some("2");

        if request.contains("maxlag") && state.lag_errors > 0 {
            state.lag_errors -= 1;
            return RawResponse {
                status: 200,
                retry_after: state.lag_retry_after,
                body: json!({"error": {
                    "code": "maxlag",
                    "info": "Waiting for 10.64.0.12: 3 seconds lagged",
                    "host": "10.64.0.12",
                    "lag": 3
                }})
                .to_string()
                .into(),
            };
        }

        let mut body = match request.action() {
            "query" => self.query(&mut state, request, fv2),
            "tokens" => {
                let mut tokens = Map::new();
                for kind in request.get("type").unwrap_or("edit").split('|') {
                    tokens.insert(format!("{kind}token"), Value::String(state.issue_token()));
                }
                json!({ "tokens": tokens })
            }
            "edit" => self.edit(&mut state, request),
            "login" => self.login(&mut state, request),
            "logout" => {
                state.logged_in = false;
                json!({})
            }
            other => json!({"error": {
                "code": "unknown_action",
                "info": format!("Unrecognized value for parameter 'action': {other}"),
            }}),
        };

        if request.contains("maxlag")
            && state.unknown_maxlag
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert(
                "warnings".to_string(),
                warning_value("main", "Unrecognized parameter: maxlag.", fv2),
            );
        }
        RawResponse::ok(body.to_string())
    }

    fn query(&self, state: &mut WikiState, request: &WireRequest, fv2: bool) -> Value {
        let legacy = self.generator == LEGACY;
        let mut query = Map::new();
        let mut continuation = Map::new();
        let mut grouped = Map::new();

        for meta in split(request.get("meta")) {
            match meta {
                "siteinfo" => {
                    query.insert(
                        "general".to_string(),
                        json!({"sitename": "Fake Wiki", "generator": self.generator}),
                    );
                    query.insert("dbrepllag".to_string(), json!([{"host": "db1", "lag": 0}]));
                }
                "tokens" => {
                    let mut tokens = Map::new();
                    for kind in split(request.get("type")) {
                        let value = if kind == "login" {
                            format!("{HANDSHAKE_TOKEN}+\\")
                        } else {
                            state.issue_token()
                        };
                        tokens.insert(format!("{kind}token"), Value::String(value));
                    }
                    query.insert("tokens".to_string(), Value::Object(tokens));
                }
                "userinfo" => {
                    query.insert(
                        "userinfo".to_string(),
                        json!({
                            "id": if state.logged_in { 7 } else { 0 },
                            "name": if state.logged_in { "ExampleBot" } else { "127.0.0.1" },
                            "rights": state.rights,
                        }),
                    );
                }
                _ => {}
            }
        }

        for list in split(request.get("list")) {
            match list {
                "categorymembers" => {
                    if let Some(limit) = state.fail_list_after
                        && state.list_served >= limit
                    {
                        return json!({"error": {
                            "code": "permissiondenied",
                            "info": "You are not allowed to list this category.",
                        }});
                    }
                    state.list_served += 1;
                    let (items, next) = page_slice(&state.members, request, "cm");
                    let items: Vec<Value> = items
                        .iter()
                        .map(|(_, title)| json!({"ns": 0, "title": title}))
                        .collect();
                    query.insert("categorymembers".to_string(), Value::Array(items));
                    if let Some(next) = next {
                        add_continue(
                            &mut continuation,
                            &mut grouped,
                            "categorymembers",
                            "cmcontinue",
                            next,
                        );
                    }
                }
                "recentchanges" if request.get("rctoken") == Some("patrol") => {
                    query.insert(
                        "recentchanges".to_string(),
                        json!([{
                            "type": "edit",
                            "title": "Sandbox",
                            "patroltoken": state.issue_token(),
                        }]),
                    );
                }
                "users" => {
                    let user = request.get("ususers").unwrap_or_default();
                    let mut entry = json!({"name": user, "userid": 12});
                    if request.get("ustoken") == Some("userrights") {
                        entry["userrightstoken"] = Value::String(state.issue_token());
                    }
                    query.insert("users".to_string(), json!([entry]));
                }
                _ => {}
            }
        }

        // Page set: explicit titles or the categorymembers generator.
        let mut pages: Vec<(usize, String)> = Vec::new();
        if request.get("generator") == Some("categorymembers") {
            let (slice, next) = page_slice(&state.members, request, "gcm");
            pages = slice;
            if let Some(next) = next {
                add_continue(
                    &mut continuation,
                    &mut grouped,
                    "categorymembers",
                    "gcmcontinue",
                    next,
                );
            }
        } else if let Some(titles) = request.get("titles") {
            pages = titles
                .split('|')
                .map(|t| (self.page_id(state, t), t.to_string()))
                .collect();
        }

        if !pages.is_empty() {
            let mut objects: Vec<Map<String, Value>> = pages
                .iter()
                .map(|(id, title)| {
                    let mut page = Map::new();
                    page.insert("pageid".to_string(), json!(id));
                    page.insert("ns".to_string(), json!(0));
                    page.insert("title".to_string(), json!(title));
                    page
                })
                .collect();

            for prop in split(request.get("prop")) {
                match prop {
                    "info" => {
                        for page in &mut objects {
                            page.insert("length".to_string(), json!(1024));
                            if let Some(kind) = request.get("intoken") {
                                let token = Value::String(state.issue_token());
                                page.insert(format!("{kind}token"), token);
                            }
                        }
                    }
                    "revisions" => {
                        for page in &mut objects {
                            let mut rev = json!({"revid": 100, "user": "Vandal"});
                            if request.get("rvtoken") == Some("rollback") {
                                rev["rollbacktoken"] = Value::String(state.issue_token());
                            }
                            page.insert("revisions".to_string(), json!([rev]));
                        }
                    }
                    "categories" => {
                        if let Some(next) = categories_batch(&mut objects, request) {
                            add_continue(
                                &mut continuation,
                                &mut grouped,
                                "categories",
                                "clcontinue",
                                next,
                            );
                        }
                    }
                    _ => {}
                }
            }

            let pages_value = if fv2 {
                Value::Array(objects.into_iter().map(Value::Object).collect())
            } else {
                Value::Object(
                    objects
                        .into_iter()
                        .map(|p| (p["pageid"].to_string(), Value::Object(p)))
                        .collect(),
                )
            };
            query.insert("pages".to_string(), pages_value);
        }

        let mut body = Map::new();
        if !query.is_empty() {
            body.insert("query".to_string(), Value::Object(query));
        }
        if legacy {
            if !grouped.is_empty() {
                body.insert("query-continue".to_string(), Value::Object(grouped));
            }
        } else if !continuation.is_empty() {
            continuation.insert("continue".to_string(), json!("-||"));
            body.insert("continue".to_string(), Value::Object(continuation));
        } else {
            body.insert(
                "batchcomplete".to_string(),
                if fv2 { json!(true) } else { json!("") },
            );
        }
        if let Some(text) = &state.query_warning {
            body.insert("warnings".to_string(), warning_value("query", text, fv2));
        }
        Value::Object(body)
    }

    fn page_id(&self, state: &WikiState, title: &str) -> usize {
        state
            .members
            .iter()
            .position(|m| m == title)
            .map_or_else(|| 9000 + title.len(), |i| i + 1)
    }

    fn edit(&self, state: &mut WikiState, request: &WireRequest) -> Value {
        let token = request.get("token");
        if state.bad_tokens > 0 {
            state.bad_tokens -= 1;
            return badtoken();
        }
        if token.is_none() || token != state.valid_token.as_deref() {
            return badtoken();
        }
        if state.captcha && request.get("captchaword").is_none() {
            return json!({"edit": {
                "result": "Failure",
                "captcha": {
                    "type": "image",
                    "mime": "image/png",
                    "id": "42",
                    "url": "/captcha/42.png",
                }
            }});
        }
        state.token_serial += 1;
        json!({"edit": {
            "result": "Success",
            "pageid": 1,
            "title": request.get("title").unwrap_or_default(),
            "newrevid": 1000 + state.token_serial,
        }})
    }

    fn login(&self, state: &mut WikiState, request: &WireRequest) -> Value {
        let lgtoken = request.get("lgtoken").map(|t| t.trim_end_matches("+\\"));
        match lgtoken {
            None if self.generator != CURRENT => json!({"login": {
                "result": "NeedToken",
                "token": HANDSHAKE_TOKEN,
            }}),
            Some(HANDSHAKE_TOKEN) if request.get("lgpassword") == Some("correct horse") => {
                state.logged_in = true;
                json!({"login": {
                    "result": "Success",
                    "lguserid": 7,
                    "lgusername": request.get("lgname").unwrap_or_default(),
                }})
            }
            Some(HANDSHAKE_TOKEN) => json!({"login": {"result": "WrongPass"}}),
            _ => json!({"login": {"result": "WrongToken"}}),
        }
    }
}

impl WikiState {
    fn issue_token(&mut self) -> String {
        self.token_serial += 1;
        let token = format!("{:032x}+\\", self.token_serial);
        self.valid_token = Some(token.clone());
        token
    }
}

#[async_trait]
impl Transport for FakeWiki {
    async fn send(&self, request: &WireRequest) -> Result<RawResponse> {
        Ok(self.respond(request))
    }
}

fn split(value: Option<&str>) -> Vec<&str> {
    value
        .map(|v| v.split('|').collect())
        .unwrap_or_default()
}

fn badtoken() -> Value {
    json!({"error": {"code": "badtoken", "info": "Invalid CSRF token."}})
}

fn warning_value(module: &str, text: &str, fv2: bool) -> Value {
    if fv2 {
        json!({ module: {"warnings": text} })
    } else {
        json!({ module: {"*": text} })
    }
}

fn add_continue(
    unified: &mut Map<String, Value>,
    grouped: &mut Map<String, Value>,
    module: &str,
    key: &str,
    value: String,
) {
    unified.insert(key.to_string(), Value::String(value.clone()));
    grouped.insert(module.to_string(), json!({ key: value }));
}

/// One batch of `members` for a module with wire prefix `prefix`, and the
/// continue value when more remain.
fn page_slice(
    members: &[String],
    request: &WireRequest,
    prefix: &str,
) -> (Vec<(usize, String)>, Option<String>) {
    let limit: usize = request
        .get(&format!("{prefix}limit"))
        .and_then(|l| l.parse().ok())
        .unwrap_or(10);
    let start: usize = request
        .get(&format!("{prefix}continue"))
        .and_then(|c| c.strip_prefix("page|"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    let end = (start + limit).min(members.len());
    let slice = members[start.min(end)..end]
        .iter()
        .enumerate()
        .map(|(i, title)| (start + i + 1, title.clone()))
        .collect();
    let next = (end < members.len()).then(|| format!("page|{end}"));
    (slice, next)
}

/// Attach up to `cllimit` categories across `pages`, resuming at
/// `clcontinue`. Every page is in all three categories.
fn categories_batch(pages: &mut [Map<String, Value>], request: &WireRequest) -> Option<String> {
    let limit: usize = request
        .get("cllimit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(10);
    let start: usize = request
        .get("clcontinue")
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let total = pages.len() * CATEGORIES.len();
    let end = (start + limit).min(total);
    for flat in start..end {
        let page = &mut pages[flat / CATEGORIES.len()];
        let entry = page
            .entry("categories".to_string())
            .or_insert_with(|| json!([]));
        if let Some(list) = entry.as_array_mut() {
            list.push(json!({"ns": 14, "title": CATEGORIES[flat % CATEGORIES.len()]}));
        }
    }
    (end < total).then(|| end.to_string())
}

/// Client settings for tests: no pacing, fast retries.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        pacing: PacingPolicy::disabled(),
        retry_policy: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
            default_lag_delay: Duration::from_millis(1),
        },
        ..ClientConfig::new(ENDPOINT)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("wikiwire_protocol=debug")
        .with_test_writer()
        .try_init();
}
