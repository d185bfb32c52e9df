//! Module inputs and page-set selectors
//!
//! A [`ModuleInput`] describes one API module the caller wants to run: its
//! name, parameter prefix, capability flags and parameters. The engine never
//! looks at concrete module semantics; it dispatches on [`Capabilities`] and
//! [`ModuleKind`] only.

use std::collections::BTreeMap;

use crate::token::{TokenKind, TokenScope};

/// Where a module lives in the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// `action=query&list=...`
    List,
    /// `action=query&prop=...`
    Prop,
    /// `action=query&meta=...`
    Meta,
    /// A top-level `action=...` module, typically a write.
    Action,
}

/// Capability flags a module declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities {
    /// Accepts a per-request batch size (`<prefix>limit`).
    pub limitable: bool,
    /// Can seed the page set of the request (`generator=<name>`).
    pub generator: bool,
    /// Fetches facts about an existing page set.
    pub property: bool,
}

/// A parameter value before wire serialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    /// Multi-value parameter, joined with `|` on the wire.
    List(Vec<String>),
    /// Boolean parameter; only sent when true.
    Flag(bool),
}

impl ParamValue {
    /// Wire form, or `None` when the parameter should be omitted.
    pub fn to_wire(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::List(values) => Some(join_multi(values)),
            Self::Flag(true) => Some("1".to_string()),
            Self::Flag(false) => None,
        }
    }
}

/// Join multi-values with `|`, switching to the U+001F separator form when
/// a value itself contains a pipe.
pub(crate) fn join_multi(values: &[String]) -> String {
    if values.iter().any(|v| v.contains('|')) {
        let mut out = String::from('\u{1f}');
        out.push_str(&values.join("\u{1f}"));
        out
    } else {
        values.join("|")
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(values: Vec<String>) -> Self {
        Self::List(values)
    }
}

impl From<&[&str]> for ParamValue {
    fn from(values: &[&str]) -> Self {
        Self::List(values.iter().map(ToString::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ParamValue {
    fn from(values: [&str; N]) -> Self {
        Self::List(values.iter().map(ToString::to_string).collect())
    }
}

/// Selector mode of a request's page set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorMode {
    Titles,
    PageIds,
    RevIds,
    Generator,
}

/// Target entities of a request. Exactly one mode is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PageSetSelector {
    /// No page set (list/meta modules, most writes).
    #[default]
    None,
    Titles(Vec<String>),
    PageIds(Vec<u64>),
    RevIds(Vec<u64>),
    /// Page set produced by the request's generator module.
    Generator,
}

impl PageSetSelector {
    pub fn titles<I, S>(titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Titles(titles.into_iter().map(Into::into).collect())
    }

    pub fn page_ids(ids: impl IntoIterator<Item = u64>) -> Self {
        Self::PageIds(ids.into_iter().collect())
    }

    pub fn rev_ids(ids: impl IntoIterator<Item = u64>) -> Self {
        Self::RevIds(ids.into_iter().collect())
    }

    pub fn mode(&self) -> Option<SelectorMode> {
        match self {
            Self::None => None,
            Self::Titles(_) => Some(SelectorMode::Titles),
            Self::PageIds(_) => Some(SelectorMode::PageIds),
            Self::RevIds(_) => Some(SelectorMode::RevIds),
            Self::Generator => Some(SelectorMode::Generator),
        }
    }

    /// True for an explicitly chosen mode carrying no values.
    pub(crate) fn is_empty_explicit(&self) -> bool {
        match self {
            Self::Titles(v) => v.is_empty(),
            Self::PageIds(v) => v.is_empty(),
            Self::RevIds(v) => v.is_empty(),
            Self::None | Self::Generator => false,
        }
    }

    /// `(parameter, value)` this selector contributes, if any.
    pub(crate) fn wire_param(&self) -> Option<(&'static str, String)> {
        let join_ids = |ids: &[u64]| {
            ids.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|")
        };
        match self {
            Self::Titles(titles) => Some(("titles", join_multi(titles))),
            Self::PageIds(ids) => Some(("pageids", join_ids(ids))),
            Self::RevIds(ids) => Some(("revids", join_ids(ids))),
            Self::None | Self::Generator => None,
        }
    }
}

/// Batch size and total cap of a limitable module. The two are independent:
/// the batch size is the server page size, the cap is how many items the
/// caller wants in total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limit {
    pub batch_size: Option<u32>,
    pub max_items: Option<usize>,
}

/// Token a module needs before it can be sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenRequirement {
    pub kind: TokenKind,
    pub scope: TokenScope,
}

/// One module of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInput {
    name: String,
    prefix: String,
    kind: ModuleKind,
    capabilities: Capabilities,
    params: BTreeMap<String, ParamValue>,
    global_params: BTreeMap<String, ParamValue>,
    limit: Limit,
    as_generator: bool,
    selectors: Option<Vec<SelectorMode>>,
    token: Option<TokenRequirement>,
    requires_post: bool,
    result_field: Option<String>,
}

impl ModuleInput {
    fn new(name: &str, prefix: &str, kind: ModuleKind, capabilities: Capabilities) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            kind,
            capabilities,
            params: BTreeMap::new(),
            global_params: BTreeMap::new(),
            limit: Limit::default(),
            as_generator: false,
            selectors: None,
            token: None,
            requires_post: false,
            result_field: None,
        }
    }

    /// A list module such as `categorymembers` (prefix `cm`). Lists are
    /// limitable and may act as generators.
    pub fn list(name: &str, prefix: &str) -> Self {
        Self::new(
            name,
            prefix,
            ModuleKind::List,
            Capabilities {
                limitable: true,
                generator: true,
                property: false,
            },
        )
    }

    /// A property module such as `revisions` (prefix `rv`).
    pub fn prop(name: &str, prefix: &str) -> Self {
        Self::new(
            name,
            prefix,
            ModuleKind::Prop,
            Capabilities {
                limitable: false,
                generator: false,
                property: true,
            },
        )
    }

    /// A meta module such as `siteinfo` (prefix `si`).
    pub fn meta(name: &str, prefix: &str) -> Self {
        Self::new(name, prefix, ModuleKind::Meta, Capabilities::default())
    }

    /// A top-level action such as `edit`. Action parameters are unprefixed.
    pub fn action(name: &str) -> Self {
        Self::new(name, "", ModuleKind::Action, Capabilities::default())
    }

    /// Declare the module limitable.
    #[must_use]
    pub fn limitable(mut self) -> Self {
        self.capabilities.limitable = true;
        self
    }

    /// Declare that the module can seed a page set.
    #[must_use]
    pub fn generator_capable(mut self) -> Self {
        self.capabilities.generator = true;
        self
    }

    /// Use this module as the request's generator.
    #[must_use]
    pub fn as_generator(mut self) -> Self {
        self.as_generator = true;
        self
    }

    /// Module parameter, without the module prefix.
    #[must_use]
    pub fn param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    /// Request-wide parameter such as `redirects` or `converttitles`.
    #[must_use]
    pub fn global_param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.global_params.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.limit.batch_size = Some(batch_size);
        self
    }

    #[must_use]
    pub fn max_items(mut self, max_items: usize) -> Self {
        self.limit.max_items = Some(max_items);
        self
    }

    /// Restrict the selector modes this module accepts.
    #[must_use]
    pub fn supported_selectors(mut self, modes: &[SelectorMode]) -> Self {
        self.selectors = Some(modes.to_vec());
        self
    }

    /// Require a session-scoped token of `kind`.
    #[must_use]
    pub fn token(self, kind: TokenKind) -> Self {
        self.token_scoped(kind, TokenScope::Session)
    }

    /// Require a token of `kind` scoped to a specific entity.
    #[must_use]
    pub fn token_scoped(mut self, kind: TokenKind, scope: TokenScope) -> Self {
        self.token = Some(TokenRequirement { kind, scope });
        self.requires_post = true;
        self
    }

    #[must_use]
    pub fn post(mut self) -> Self {
        self.requires_post = true;
        self
    }

    /// Key under which a property module's items appear in each page
    /// object, when it differs from the module name.
    #[must_use]
    pub fn result_field(mut self, field: &str) -> Self {
        self.result_field = Some(field.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn global_params(&self) -> &BTreeMap<String, ParamValue> {
        &self.global_params
    }

    pub fn limit(&self) -> Limit {
        self.limit
    }

    pub fn is_generator(&self) -> bool {
        self.as_generator
    }

    pub fn selectors(&self) -> Option<&[SelectorMode]> {
        self.selectors.as_deref()
    }

    pub fn token_requirement(&self) -> Option<&TokenRequirement> {
        self.token.as_ref()
    }

    pub fn requires_post(&self) -> bool {
        self.requires_post
    }

    /// Prefix used on the wire: generators get an extra `g`.
    pub fn wire_prefix(&self) -> String {
        if self.as_generator {
            format!("g{}", self.prefix)
        } else {
            self.prefix.clone()
        }
    }

    /// Where this module's results accumulate for cap accounting.
    pub(crate) fn result_slot(&self) -> ResultSlot {
        if self.as_generator {
            return ResultSlot::Pages;
        }
        match self.kind {
            ModuleKind::List => ResultSlot::List(self.name.clone()),
            ModuleKind::Prop => ResultSlot::PageField(
                self.result_field
                    .clone()
                    .unwrap_or_else(|| self.name.clone()),
            ),
            ModuleKind::Meta => ResultSlot::Meta(self.name.clone()),
            ModuleKind::Action => ResultSlot::None,
        }
    }
}

/// Location of a module's results inside an accumulated query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResultSlot {
    Pages,
    List(String),
    PageField(String),
    Meta(String),
    None,
}
