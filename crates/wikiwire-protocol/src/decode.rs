//! Response decoding
//!
//! Splits a raw JSON body into result data, server errors, warnings,
//! continuation markers and per-item errors without knowing which module
//! produced it. Both the legacy output format (`*`-keyed text, page objects
//! keyed by id) and `formatversion=2` (arrays, plain strings) are accepted.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::outcome::{ItemError, Warning};
use crate::transport::RawResponse;

/// Top-level keys that carry protocol envelope rather than result data.
const ENVELOPE_KEYS: &[&str] = &[
    "continue",
    "query-continue",
    "warnings",
    "batchcomplete",
    "error",
    "errors",
    "servedby",
    "requestid",
    "docref",
];

/// Maximum depth searched for per-item `error` objects.
const ITEM_ERROR_DEPTH: usize = 6;

/// Continuation markers exactly as the server sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawContinuation {
    /// `continue: { ... }`
    Unified(BTreeMap<String, String>),
    /// `query-continue: { <module>: { ... } }`
    Legacy(BTreeMap<String, BTreeMap<String, String>>),
}

/// A server-reported error.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    pub code: String,
    pub info: String,
    /// Reported replication lag in seconds, for `maxlag` errors.
    pub lag: Option<f64>,
}

/// One decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    /// Result tree with envelope keys removed.
    pub data: Value,
    pub errors: Vec<ServerError>,
    pub warnings: Vec<Warning>,
    pub continuation: Option<RawContinuation>,
    pub batch_complete: bool,
    pub item_errors: Vec<ItemError>,
}

/// Decode a raw response body.
pub fn decode(raw: &RawResponse) -> Result<DecodedResponse> {
    let value: Value = serde_json::from_slice(&raw.body)
        .map_err(|e| Error::protocol(format!("response is not JSON: {e}"), &raw.body))?;
    let Value::Object(body) = value else {
        return Err(Error::protocol("response is not a JSON object", &raw.body));
    };

    let errors = take_errors(&body);
    let parts = split_body(body);

    Ok(DecodedResponse {
        status: raw.status,
        retry_after: raw.retry_after,
        data: parts.data,
        errors,
        warnings: parts.warnings,
        continuation: parts.continuation,
        batch_complete: parts.batch_complete,
        item_errors: parts.item_errors,
    })
}

pub(crate) struct BodyParts {
    pub data: Value,
    pub warnings: Vec<Warning>,
    pub continuation: Option<RawContinuation>,
    pub batch_complete: bool,
    pub item_errors: Vec<ItemError>,
}

/// Separate envelope keys from result data.
pub(crate) fn split_body(mut body: Map<String, Value>) -> BodyParts {
    let warnings = body
        .get("warnings")
        .map(parse_warnings)
        .unwrap_or_default();
    let continuation = parse_continuation(&body);
    let batch_complete = body
        .get("batchcomplete")
        .is_some_and(|v| !matches!(v, Value::Bool(false)));

    for key in ENVELOPE_KEYS {
        body.remove(*key);
    }

    let data = Value::Object(body);
    let mut item_errors = Vec::new();
    collect_item_errors(&data, 0, &mut item_errors);

    BodyParts {
        data,
        warnings,
        continuation,
        batch_complete,
        item_errors,
    }
}

fn take_errors(body: &Map<String, Value>) -> Vec<ServerError> {
    let mut out = Vec::new();
    if let Some(error) = body.get("error") {
        out.push(ServerError {
            code: text_field(error, "code").unwrap_or_else(|| "unknown".to_string()),
            info: text_field(error, "info")
                .or_else(|| text_field(error, "*"))
                .unwrap_or_default(),
            lag: error.get("lag").and_then(Value::as_f64),
        });
    }
    // errorformat=plaintext|wikitext|html
    if let Some(Value::Array(errors)) = body.get("errors") {
        for error in errors {
            out.push(ServerError {
                code: text_field(error, "code").unwrap_or_else(|| "unknown".to_string()),
                info: text_field(error, "text")
                    .or_else(|| text_field(error, "*"))
                    .unwrap_or_default(),
                lag: error.pointer("/data/lag").and_then(Value::as_f64),
            });
        }
    }
    out
}

fn parse_warnings(value: &Value) -> Vec<Warning> {
    let mut out = Vec::new();
    match value {
        Value::Object(modules) => {
            for (module, entry) in modules {
                let text = text_field(entry, "*")
                    .or_else(|| text_field(entry, "warnings"))
                    .unwrap_or_else(|| entry.to_string());
                out.extend(text.lines().filter(|l| !l.trim().is_empty()).map(|line| Warning {
                    module: module.clone(),
                    code: None,
                    message: line.trim().to_string(),
                }));
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                out.push(Warning {
                    module: text_field(entry, "module").unwrap_or_else(|| "main".to_string()),
                    code: text_field(entry, "code"),
                    message: text_field(entry, "text")
                        .or_else(|| text_field(entry, "*"))
                        .unwrap_or_default(),
                });
            }
        }
        _ => {}
    }
    out
}

fn parse_continuation(body: &Map<String, Value>) -> Option<RawContinuation> {
    if let Some(Value::Object(map)) = body.get("continue") {
        let params: BTreeMap<String, String> =
            map.iter().map(|(k, v)| (k.clone(), scalar_text(v))).collect();
        if !params.is_empty() {
            return Some(RawContinuation::Unified(params));
        }
    }
    if let Some(Value::Object(groups)) = body.get("query-continue") {
        let groups: BTreeMap<String, BTreeMap<String, String>> = groups
            .iter()
            .filter_map(|(module, params)| {
                let params: BTreeMap<String, String> = params
                    .as_object()?
                    .iter()
                    .map(|(k, v)| (k.clone(), scalar_text(v)))
                    .collect();
                (!params.is_empty()).then(|| (module.clone(), params))
            })
            .collect();
        if !groups.is_empty() {
            return Some(RawContinuation::Legacy(groups));
        }
    }
    None
}

fn collect_item_errors(value: &Value, depth: usize, out: &mut Vec<ItemError>) {
    if depth > ITEM_ERROR_DEPTH {
        return;
    }
    match value {
        Value::Object(map) => {
            if depth > 0
                && let Some(error) = map.get("error")
                && let Some(code) = text_field(error, "code")
            {
                out.push(ItemError {
                    code,
                    info: text_field(error, "info")
                        .or_else(|| text_field(error, "text"))
                        .unwrap_or_default(),
                    item: map
                        .get("title")
                        .or_else(|| map.get("id"))
                        .map(scalar_text),
                });
            }
            for (key, child) in map {
                if key != "error" {
                    collect_item_errors(child, depth + 1, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_item_errors(item, depth + 1, out);
            }
        }
        _ => {}
    }
}

/// Page objects of a `pages` node in either output format.
pub(crate) fn page_objects(pages: &Value) -> Vec<&Value> {
    match pages {
        Value::Array(items) => items.iter().filter(|v| v.is_object()).collect(),
        Value::Object(map) => map.values().filter(|v| v.is_object()).collect(),
        _ => Vec::new(),
    }
}

/// Text of a field that is either a plain string or a legacy `{"*": ...}`.
pub(crate) fn text_field(value: &Value, name: &str) -> Option<String> {
    match value.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("*").and_then(Value::as_str).map(ToString::to_string),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
