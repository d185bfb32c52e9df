//! Server version detection and protocol generations
//!
//! The API family has changed how tokens are handed out and how continuation
//! works several times. A session probes `meta=siteinfo` once at connect and
//! keeps the resulting [`SiteInfo`] for its whole lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::outcome::ApiResult;

/// `major.minor` of the server software, parsed from the `generator` field
/// (e.g. `MediaWiki 1.39.4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteVersion {
    pub major: u32,
    pub minor: u32,
}

impl SiteVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse a `generator` string such as `MediaWiki 1.35.0-wmf.18`.
    pub fn parse(generator: &str) -> Option<Self> {
        let version = generator.split_whitespace().last()?;
        let mut parts = version.split('.');
        let major = leading_number(parts.next()?)?;
        let minor = leading_number(parts.next()?)?;
        Some(Self { major, minor })
    }

    /// Servers from this version on accept `formatversion=2`.
    pub fn supports_format_v2(self) -> bool {
        self >= Self::new(1, 25)
    }

    /// Servers from this version on hand out login tokens through the
    /// unified token endpoint instead of the `NeedToken` handshake.
    pub fn has_login_token_endpoint(self) -> bool {
        self >= Self::new(1, 27)
    }
}

impl fmt::Display for SiteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Token and continuation dialect spoken by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolGeneration {
    /// Before 1.20: per-field token queries (`intoken`, `rctoken`, `rvtoken`,
    /// `ustoken`) and `query-continue` continuation.
    Legacy,
    /// 1.20 to 1.23: the `action=tokens` module and the unified `continue`
    /// object (opted into with `continue=`).
    Transitional,
    /// 1.24 and later: `meta=tokens` for every session-scoped kind.
    Current,
}

impl ProtocolGeneration {
    pub fn from_version(version: SiteVersion) -> Self {
        if version < SiteVersion::new(1, 20) {
            Self::Legacy
        } else if version < SiteVersion::new(1, 24) {
            Self::Transitional
        } else {
            Self::Current
        }
    }

    /// Whether continuation uses the grouped `query-continue` object.
    pub fn uses_legacy_continuation(self) -> bool {
        matches!(self, Self::Legacy)
    }
}

impl fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Legacy => "legacy",
            Self::Transitional => "transitional",
            Self::Current => "current",
        };
        f.write_str(name)
    }
}

/// Facts about the connected server, fixed for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub site_name: Option<String>,
    pub version: SiteVersion,
    pub generation: ProtocolGeneration,
    /// Whether the server reports replication lag; `maxlag` is only sent
    /// when it does.
    pub lag_reporting: bool,
}

impl SiteInfo {
    /// Assumed before the probe has run: the oldest dialect, no `maxlag`.
    pub(crate) fn bootstrap() -> Self {
        Self {
            site_name: None,
            version: SiteVersion::new(1, 0),
            generation: ProtocolGeneration::Legacy,
            lag_reporting: false,
        }
    }

    /// Build from a `meta=siteinfo&siprop=general|dbrepllag` result.
    pub fn from_result(result: &ApiResult) -> Result<Self> {
        let general = result
            .data
            .pointer("/query/general")
            .ok_or_else(|| missing("query.general"))?;
        let generator = general
            .get("generator")
            .and_then(|v| v.as_str())
            .ok_or_else(|| missing("query.general.generator"))?;
        let version = SiteVersion::parse(generator).ok_or_else(|| Error::Protocol {
            message: format!("unrecognised generator string '{generator}'"),
            payload: general.to_string(),
        })?;
        let site_name = general
            .get("sitename")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        let lag_reporting = result
            .data
            .pointer("/query/dbrepllag")
            .is_some_and(|v| v.is_array());

        Ok(Self {
            site_name,
            version,
            generation: ProtocolGeneration::from_version(version),
            lag_reporting,
        })
    }
}

fn missing(what: &str) -> Error {
    Error::Protocol {
        message: format!("siteinfo response lacks {what}"),
        payload: String::new(),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_generator_strings() {
        assert_eq!(
            SiteVersion::parse("MediaWiki 1.39.4"),
            Some(SiteVersion::new(1, 39))
        );
        assert_eq!(
            SiteVersion::parse("MediaWiki 1.35.0-wmf.18"),
            Some(SiteVersion::new(1, 35))
        );
        assert_eq!(
            SiteVersion::parse("MediaWiki 1.19alpha"),
            Some(SiteVersion::new(1, 19))
        );
        assert_eq!(SiteVersion::parse("garbage"), None);
    }

    #[test]
    fn test_generation_boundaries() {
        let generation = |minor| ProtocolGeneration::from_version(SiteVersion::new(1, minor));
        assert_eq!(generation(16), ProtocolGeneration::Legacy);
        assert_eq!(generation(19), ProtocolGeneration::Legacy);
        assert_eq!(generation(20), ProtocolGeneration::Transitional);
        assert_eq!(generation(23), ProtocolGeneration::Transitional);
        assert_eq!(generation(24), ProtocolGeneration::Current);
        assert_eq!(generation(41), ProtocolGeneration::Current);
    }

    #[test]
    fn test_from_result_detects_lag_reporting() {
        let result = ApiResult::from_value(json!({
            "query": {
                "general": {"sitename": "Testwiki", "generator": "MediaWiki 1.31.0"},
                "dbrepllag": [{"host": "db1", "lag": 0}]
            }
        }));
        let info = SiteInfo::from_result(&result).expect("siteinfo should parse");
        assert_eq!(info.site_name.as_deref(), Some("Testwiki"));
        assert_eq!(info.generation, ProtocolGeneration::Current);
        assert!(info.lag_reporting);

        let result = ApiResult::from_value(json!({
            "query": {"general": {"generator": "MediaWiki 1.18.1"}}
        }));
        let info = SiteInfo::from_result(&result).expect("siteinfo should parse");
        assert_eq!(info.generation, ProtocolGeneration::Legacy);
        assert!(!info.lag_reporting);
    }

    #[test]
    fn test_from_result_rejects_missing_general() {
        let result = ApiResult::from_value(json!({"query": {}}));
        assert!(matches!(
            SiteInfo::from_result(&result),
            Err(Error::Protocol { .. })
        ));
    }
}
