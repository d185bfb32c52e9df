//! Continuation: carrying server state between rounds of a query
//!
//! Servers speaking the unified dialect return a flat `continue` object that
//! is echoed back verbatim. Legacy servers return `query-continue` grouped by
//! module; there the non-generator modules are continued first while the
//! generator position is held, and the generator advances only once they are
//! exhausted.

mod accumulate;
mod engine;

pub use accumulate::{AccumulatedResult, EntityKey};
pub use engine::{QueryResult, QueryStatus, QueryStream, RoundBatch};

use std::collections::{BTreeMap, BTreeSet};

use crate::decode::RawContinuation;
use crate::module::ModuleInput;

/// Parameters to send with the next round of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationState {
    Unified(BTreeMap<String, String>),
    Legacy {
        params: BTreeMap<String, String>,
        /// Generator parameters in force while other modules continue.
        generator_position: BTreeMap<String, String>,
    },
}

impl ContinuationState {
    pub fn next_params(&self) -> impl Iterator<Item = (&String, &String)> {
        match self {
            Self::Unified(params) | Self::Legacy { params, .. } => params.iter(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match self {
            Self::Unified(params) | Self::Legacy { params, .. } => {
                params.get(name).map(String::as_str)
            }
        }
    }

    /// State for the round after a response carrying `raw`; `None` once the
    /// server reports nothing more.
    pub fn advance(
        previous: Option<&Self>,
        raw: Option<&RawContinuation>,
        generator: Option<&str>,
    ) -> Option<Self> {
        match raw? {
            RawContinuation::Unified(params) => Some(Self::Unified(params.clone())),
            RawContinuation::Legacy(groups) => {
                let held = match previous {
                    Some(Self::Legacy {
                        generator_position, ..
                    }) => generator_position.clone(),
                    _ => BTreeMap::new(),
                };
                let others: BTreeMap<String, String> = groups
                    .iter()
                    .filter(|(module, _)| Some(module.as_str()) != generator)
                    .flat_map(|(_, params)| params.clone())
                    .collect();

                if !others.is_empty() {
                    let mut params = others;
                    params.extend(held.clone());
                    return Some(Self::Legacy {
                        params,
                        generator_position: held,
                    });
                }
                let advanced = groups.get(generator?)?.clone();
                Some(Self::Legacy {
                    params: advanced.clone(),
                    generator_position: advanced,
                })
            }
        }
    }
}

/// Modules the server still has data for.
pub(crate) fn pending_modules(raw: &RawContinuation, inputs: &[ModuleInput]) -> BTreeSet<String> {
    match raw {
        RawContinuation::Unified(params) => params
            .keys()
            .filter(|key| key.as_str() != "continue")
            .filter_map(|key| owner_of(key, inputs))
            .collect(),
        RawContinuation::Legacy(groups) => groups
            .keys()
            .filter(|module| inputs.iter().any(|m| m.name() == module.as_str()))
            .cloned()
            .collect(),
    }
}

/// Module whose wire prefix is the longest proper prefix of `key`.
fn owner_of(key: &str, inputs: &[ModuleInput]) -> Option<String> {
    inputs
        .iter()
        .map(|m| (m, m.wire_prefix()))
        .filter(|(_, prefix)| {
            !prefix.is_empty() && key.len() > prefix.len() && key.starts_with(prefix.as_str())
        })
        .max_by_key(|(_, prefix)| prefix.len())
        .map(|(m, _)| m.name().to_string())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_unified_state_is_verbatim() {
        let raw = RawContinuation::Unified(map(&[("cmcontinue", "page|X|1"), ("continue", "-||")]));
        let state = ContinuationState::advance(None, Some(&raw), None).unwrap();
        let params: Vec<_> = state.next_params().collect();
        assert_eq!(params.len(), 2);
        assert_eq!(state.get("cmcontinue"), Some("page|X|1"));
        assert_eq!(ContinuationState::advance(Some(&state), None, None), None);
    }

    #[test]
    fn test_legacy_holds_generator_while_properties_continue() {
        let generator = Some("categorymembers");

        // Round 1: both generator and property have more.
        let raw = RawContinuation::Legacy(
            [
                ("categorymembers".to_string(), map(&[("gcmcontinue", "G2")])),
                ("categories".to_string(), map(&[("clcontinue", "P2")])),
            ]
            .into_iter()
            .collect(),
        );
        let state = ContinuationState::advance(None, Some(&raw), generator).unwrap();
        assert_eq!(state.get("clcontinue"), Some("P2"));
        assert_eq!(state.get("gcmcontinue"), None);

        // Round 2: property exhausted, generator advances.
        let raw = RawContinuation::Legacy(
            [("categorymembers".to_string(), map(&[("gcmcontinue", "G2")]))]
                .into_iter()
                .collect(),
        );
        let state = ContinuationState::advance(Some(&state), Some(&raw), generator).unwrap();
        assert_eq!(state.get("gcmcontinue"), Some("G2"));
        assert_eq!(state.get("clcontinue"), None);

        // Round 3: property continues again on the second generator batch.
        let raw = RawContinuation::Legacy(
            [
                ("categorymembers".to_string(), map(&[("gcmcontinue", "G3")])),
                ("categories".to_string(), map(&[("clcontinue", "P9")])),
            ]
            .into_iter()
            .collect(),
        );
        let state = ContinuationState::advance(Some(&state), Some(&raw), generator).unwrap();
        assert_eq!(state.get("clcontinue"), Some("P9"));
        assert_eq!(state.get("gcmcontinue"), Some("G2"));
    }

    #[test]
    fn test_pending_modules_by_longest_prefix() {
        let inputs = [
            ModuleInput::list("categorymembers", "cm").as_generator(),
            ModuleInput::prop("categories", "cl"),
            ModuleInput::prop("categoryinfo", "ci"),
        ];
        let raw = RawContinuation::Unified(map(&[
            ("gcmcontinue", "page|1"),
            ("clcontinue", "5|Foo"),
            ("continue", "gcmcontinue||"),
        ]));
        let pending = pending_modules(&raw, &inputs);
        assert_eq!(
            pending.into_iter().collect::<Vec<_>>(),
            vec!["categories".to_string(), "categorymembers".to_string()]
        );
    }
}
