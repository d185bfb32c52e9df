//! Wire requests and the request builder
//!
//! [`RequestBuilder`] turns one or more [`ModuleInput`]s sharing a page-set
//! selector into a single [`WireRequest`]. Building is a pure function of its
//! inputs; identical inputs produce identical requests, which is what makes
//! retries safe.

use std::collections::BTreeMap;
use std::fmt;

use crate::continuation::ContinuationState;
use crate::error::{Error, Result};
use crate::module::{ModuleInput, ModuleKind, PageSetSelector, ParamValue, SelectorMode};
use crate::site::ProtocolGeneration;
use crate::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// Pacing class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Read,
    Write,
}

/// One HTTP request against the API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    method: HttpMethod,
    class: RequestClass,
    params: BTreeMap<String, String>,
}

impl WireRequest {
    pub fn new(method: HttpMethod, class: RequestClass) -> Self {
        Self {
            method,
            class,
            params: BTreeMap::new(),
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn class(&self) -> RequestClass {
        self.class
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn action(&self) -> &str {
        self.get("action").unwrap_or_default()
    }

    pub(crate) fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    /// Parameters in wire order. `token` goes last so that a truncated POST
    /// body is rejected by the server instead of half-applied.
    pub fn params(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .params
            .iter()
            .filter(|(k, _)| k.as_str() != "token")
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if let Some(token) = self.params.get("token") {
            out.push(("token", token.as_str()));
        }
        out
    }

    /// Parameters with passwords and tokens masked, for logs and errors.
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.params
            .iter()
            .map(|(k, v)| {
                let value = if is_secret_param(k) {
                    "[redacted]".to_string()
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect()
    }

    /// Module(s) addressed by this request, for error context.
    pub fn module_label(&self) -> String {
        if self.action() != "query" {
            return self.action().to_string();
        }
        ["prop", "list", "meta", "generator"]
            .iter()
            .filter_map(|k| self.get(k))
            .collect::<Vec<_>>()
            .join("|")
    }
}

fn is_secret_param(name: &str) -> bool {
    matches!(name, "lgpassword" | "password" | "retype" | "newpassword")
        || name == "token"
        || name.ends_with("token")
}

/// Session facts the builder needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub generation: ProtocolGeneration,
    /// Largest batch size the caller's account may request.
    pub high_limit: u32,
    /// `maxlag` to send, `None` when disabled for the session.
    pub maxlag: Option<u32>,
    pub format_v2: bool,
    /// Send `assert=user` on writes.
    pub assert_user: bool,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            generation: ProtocolGeneration::Current,
            high_limit: 500,
            maxlag: None,
            format_v2: false,
            assert_user: false,
        }
    }
}

/// Accumulates parameters, merging multi-values and rejecting conflicts.
#[derive(Default)]
struct ParamSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParamSet {
    fn merge(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        match (self.values.get_mut(name), value) {
            (None, _) => {
                self.values.insert(name.to_string(), value.clone());
                Ok(())
            }
            (Some(ParamValue::List(existing)), ParamValue::List(extra)) => {
                for v in extra {
                    if !existing.contains(v) {
                        existing.push(v.clone());
                    }
                }
                Ok(())
            }
            (Some(existing), _) if existing == value => Ok(()),
            (Some(_), _) => Err(Error::configuration(format!(
                "conflicting values for parameter '{name}'"
            ))),
        }
    }

    fn push_name(&mut self, name: &str, module: &str) {
        match self.values.get_mut(name) {
            Some(ParamValue::List(list)) => {
                if !list.iter().any(|m| m == module) {
                    list.push(module.to_string());
                }
            }
            _ => {
                self.values
                    .insert(name.to_string(), ParamValue::List(vec![module.to_string()]));
            }
        }
    }
}

/// Builds a [`WireRequest`] from module inputs.
pub struct RequestBuilder<'a> {
    ctx: &'a BuildContext,
    inputs: &'a [ModuleInput],
    selector: &'a PageSetSelector,
    continuation: Option<&'a ContinuationState>,
    token: Option<&'a Token>,
    limit_overrides: BTreeMap<String, u32>,
}

static NO_SELECTOR: PageSetSelector = PageSetSelector::None;

impl<'a> RequestBuilder<'a> {
    pub fn new(ctx: &'a BuildContext, inputs: &'a [ModuleInput]) -> Self {
        Self {
            ctx,
            inputs,
            selector: &NO_SELECTOR,
            continuation: None,
            token: None,
            limit_overrides: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn selector(mut self, selector: &'a PageSetSelector) -> Self {
        self.selector = selector;
        self
    }

    #[must_use]
    pub fn continuation(mut self, state: Option<&'a ContinuationState>) -> Self {
        self.continuation = state;
        self
    }

    #[must_use]
    pub fn token(mut self, token: Option<&'a Token>) -> Self {
        self.token = token;
        self
    }

    /// Send `limit` instead of the module's own batch size this round.
    #[must_use]
    pub fn limit_override(mut self, module: &str, limit: u32) -> Self {
        self.limit_overrides.insert(module.to_string(), limit);
        self
    }

    pub fn build(&self) -> Result<WireRequest> {
        self.validate()?;

        let mut set = ParamSet::default();
        let is_action = self.inputs.iter().any(|m| m.kind() == ModuleKind::Action);

        if is_action {
            let module = &self.inputs[0];
            set.merge("action", &ParamValue::from(module.name()))?;
            for (name, value) in module.params() {
                set.merge(name, value)?;
            }
        } else {
            set.merge("action", &ParamValue::from("query"))?;
            for module in self.inputs {
                self.merge_query_module(&mut set, module)?;
            }
        }

        for module in self.inputs {
            for (name, value) in module.global_params() {
                set.merge(name, value)?;
            }
        }

        if let Some((name, value)) = self.selector.wire_param() {
            set.merge(name, &ParamValue::Text(value))?;
        }

        let needs_post = self.token.is_some() || self.inputs.iter().any(ModuleInput::requires_post);
        let is_write = is_action && self.inputs.iter().any(|m| m.token_requirement().is_some());
        let mut request = WireRequest::new(
            if needs_post { HttpMethod::Post } else { HttpMethod::Get },
            if is_write { RequestClass::Write } else { RequestClass::Read },
        );

        for (name, value) in &set.values {
            if let Some(wire) = value.to_wire() {
                request.set(name.clone(), wire);
            }
        }

        request.set("format", "json");
        if self.ctx.format_v2 {
            request.set("formatversion", "2");
        }
        if !is_action {
            self.apply_continuation(&mut request);
        }
        if let Some(maxlag) = self.ctx.maxlag {
            request.set("maxlag", maxlag.to_string());
        }
        if is_write && self.ctx.assert_user {
            request.set("assert", "user");
        }
        if let Some(token) = self.token {
            request.set("token", token.value.clone());
        }

        Ok(request)
    }

    fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::configuration("at least one module is required"));
        }

        let actions = self
            .inputs
            .iter()
            .filter(|m| m.kind() == ModuleKind::Action)
            .count();
        if actions > 0 && self.inputs.len() > 1 {
            return Err(Error::configuration(
                "an action module cannot be combined with other modules",
            ));
        }

        let generators: Vec<&ModuleInput> =
            self.inputs.iter().filter(|m| m.is_generator()).collect();
        if generators.len() > 1 {
            return Err(Error::configuration(format!(
                "more than one generator module: {}",
                generators
                    .iter()
                    .map(|m| m.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        if let Some(generator) = generators.first()
            && !generator.capabilities().generator
        {
            return Err(Error::configuration(format!(
                "module '{}' cannot act as a generator",
                generator.name()
            )));
        }

        if self.selector.is_empty_explicit() {
            return Err(Error::configuration("page-set selector has no values"));
        }
        match (self.selector.mode(), generators.first()) {
            (Some(SelectorMode::Generator), None) => {
                return Err(Error::configuration(
                    "generator selector requires a generator module",
                ));
            }
            // A property generator (links, templates, ...) runs over the
            // explicit page set; a list generator replaces it.
            (Some(mode), Some(generator))
                if mode != SelectorMode::Generator && !generator.capabilities().property =>
            {
                return Err(Error::configuration(format!(
                    "selector {mode:?} conflicts with list generator '{}'",
                    generator.name()
                )));
            }
            _ => {}
        }

        if let Some(mode) = self.selector.mode() {
            for module in self.inputs {
                if let Some(supported) = module.selectors()
                    && !supported.contains(&mode)
                {
                    return Err(Error::configuration(format!(
                        "module '{}' does not accept selector {mode:?}",
                        module.name()
                    )));
                }
            }
        }

        for module in self.inputs {
            let limit = module.limit();
            if limit.batch_size.is_none() && limit.max_items.is_none() {
                continue;
            }
            if !module.capabilities().limitable {
                return Err(Error::configuration(format!(
                    "module '{}' is not limitable",
                    module.name()
                )));
            }
            if let Some(batch) = limit.batch_size {
                if batch == 0 {
                    return Err(Error::configuration(format!(
                        "batch size of '{}' must be positive",
                        module.name()
                    )));
                }
                if batch > self.ctx.high_limit {
                    return Err(Error::configuration(format!(
                        "batch size {batch} of '{}' exceeds the allowed limit {}",
                        module.name(),
                        self.ctx.high_limit
                    )));
                }
            }
            if limit.max_items == Some(0) {
                return Err(Error::configuration(format!(
                    "item cap of '{}' must be positive",
                    module.name()
                )));
            }
        }

        Ok(())
    }

    fn merge_query_module(&self, set: &mut ParamSet, module: &ModuleInput) -> Result<()> {
        if module.is_generator() {
            set.merge("generator", &ParamValue::from(module.name()))?;
        } else {
            let group = match module.kind() {
                ModuleKind::List => "list",
                ModuleKind::Prop => "prop",
                ModuleKind::Meta => "meta",
                ModuleKind::Action => {
                    return Err(Error::configuration(
                        "an action module cannot be combined with other modules",
                    ));
                }
            };
            set.push_name(group, module.name());
        }

        let prefix = module.wire_prefix();
        for (name, value) in module.params() {
            set.merge(&format!("{prefix}{name}"), value)?;
        }

        if let Some(limit) = self.effective_limit(module) {
            set.merge(&format!("{prefix}limit"), &ParamValue::from(limit))?;
        }
        Ok(())
    }

    fn effective_limit(&self, module: &ModuleInput) -> Option<u32> {
        if let Some(limit) = self.limit_overrides.get(module.name()) {
            return Some(*limit);
        }
        let limit = module.limit();
        match (limit.batch_size, limit.max_items) {
            (Some(batch), _) => Some(batch),
            (None, Some(max)) => {
                Some(u32::try_from(max).unwrap_or(u32::MAX).min(self.ctx.high_limit))
            }
            (None, None) => None,
        }
    }

    fn apply_continuation(&self, request: &mut WireRequest) {
        match self.continuation {
            Some(state) => {
                for (name, value) in state.next_params() {
                    request.set(name.clone(), value.clone());
                }
            }
            None if !self.ctx.generation.uses_legacy_continuation() => {
                request.set("continue", "");
            }
            None => {}
        }
    }
}
