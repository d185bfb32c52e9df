//! Retry policy implementation with exponential backoff

use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::outcome::{Outcome, TransientReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts per logical operation
    pub max_attempts: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration; also caps every lag wait
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add jitter to prevent thundering herd
    pub jitter: bool,

    /// Wait used for a lag signal that carries no suggested delay
    pub default_lag_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            default_lag_delay: Duration::from_secs(5),
        }
    }
}

/// What to do after a retryable outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then re-send the same request.
    ProceedAfter(Duration),
    /// Invalidate the token, rebuild the request with a fresh one, retry.
    RefreshToken,
    GiveUp,
}

impl RetryPolicy {
    /// Create retry policy from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: env_parse("WIKIWIRE_MAX_RETRIES").unwrap_or(defaults.max_attempts),
            initial_backoff: env_parse("WIKIWIRE_RETRY_BACKOFF_MS")
                .map_or(defaults.initial_backoff, Duration::from_millis),
            max_backoff: env_parse("WIKIWIRE_MAX_BACKOFF_SECS")
                .map_or(defaults.max_backoff, Duration::from_secs),
            multiplier: env_parse("WIKIWIRE_BACKOFF_MULTIPLIER").unwrap_or(defaults.multiplier),
            jitter: env_parse("WIKIWIRE_RETRY_JITTER").unwrap_or(defaults.jitter),
            default_lag_delay: env_parse("WIKIWIRE_LAG_DELAY_SECS")
                .map_or(defaults.default_lag_delay, Duration::from_secs),
        })
    }

    /// Backoff before retry number `attempt` (0-based), never above
    /// `max_backoff` even with jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = (self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_backoff.as_secs_f64());
        let mut delay = Duration::from_secs_f64(base.max(0.0));

        if self.jitter {
            let jitter = rng().random_range(0.0..0.3);
            delay += Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        }
        delay.min(self.max_backoff)
    }

    /// Decide how to continue after `outcome`.
    ///
    /// `attempt` counts the retries already spent on this operation.
    /// `token_refreshed` is true once the operation has refreshed its token;
    /// a second rejection then gives up.
    pub fn decide(&self, outcome: &Outcome, attempt: u32, token_refreshed: bool) -> RetryDecision {
        match outcome {
            Outcome::RetryableTransient(TransientReason::TokenRejected { .. }) => {
                if token_refreshed {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::RefreshToken
                }
            }
            Outcome::RetryableLag(_) | Outcome::RetryableTransient(_)
                if attempt >= self.max_attempts =>
            {
                RetryDecision::GiveUp
            }
            Outcome::RetryableLag(suggested) => {
                RetryDecision::ProceedAfter((*suggested).min(self.max_backoff))
            }
            Outcome::RetryableTransient(_) => {
                RetryDecision::ProceedAfter(self.backoff_for(attempt))
            }
            _ => RetryDecision::GiveUp,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
#[allow(
    unsafe_code,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::float_cmp
)]
mod tests {
    use super::*;
    use crate::outcome::ApiResult;
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
            default_lag_delay: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(policy.jitter);
    }

    #[test]
    fn test_from_env_custom_values() {
        let vars = [
            ("WIKIWIRE_MAX_RETRIES", "6"),
            ("WIKIWIRE_RETRY_BACKOFF_MS", "250"),
            ("WIKIWIRE_MAX_BACKOFF_SECS", "12"),
            ("WIKIWIRE_BACKOFF_MULTIPLIER", "1.5"),
            ("WIKIWIRE_RETRY_JITTER", "false"),
            ("WIKIWIRE_LAG_DELAY_SECS", "9"),
        ];
        for (name, value) in vars {
            unsafe {
                std::env::set_var(name, value);
            }
        }

        let policy = RetryPolicy::from_env().expect("Operation should succeed");
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));
        assert_eq!(policy.max_backoff, Duration::from_secs(12));
        assert!((policy.multiplier - 1.5).abs() < f64::EPSILON);
        assert!(!policy.jitter);
        assert_eq!(policy.default_lag_delay, Duration::from_secs(9));

        for (name, _) in vars {
            unsafe {
                std::env::remove_var(name);
            }
        }
    }

    #[test]
    fn test_backoff_progression_is_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_never_exceeds_max_backoff() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy()
        };
        for attempt in 0..20 {
            assert!(policy.backoff_for(attempt) <= policy.max_backoff);
        }
    }

    #[test]
    fn test_lag_waits_are_bounded() {
        let policy = policy();
        let lag = Outcome::RetryableLag(Duration::from_secs(60));
        assert_eq!(
            policy.decide(&lag, 0, false),
            RetryDecision::ProceedAfter(Duration::from_secs(1))
        );
        assert_eq!(policy.decide(&lag, 3, false), RetryDecision::GiveUp);
    }

    #[test]
    fn test_token_rejection_refreshes_once() {
        let policy = policy();
        let rejected = Outcome::RetryableTransient(TransientReason::TokenRejected {
            code: "badtoken".to_string(),
            info: "Invalid CSRF token.".to_string(),
        });
        assert_eq!(policy.decide(&rejected, 0, false), RetryDecision::RefreshToken);
        assert_eq!(policy.decide(&rejected, 0, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_terminal_outcomes_give_up() {
        let policy = policy();
        let success = Outcome::Success(ApiResult::from_value(json!({})));
        assert_eq!(policy.decide(&success, 0, false), RetryDecision::GiveUp);
        let fatal = Outcome::Fatal {
            code: "nosuchpageid".to_string(),
            info: String::new(),
        };
        assert_eq!(policy.decide(&fatal, 0, false), RetryDecision::GiveUp);
    }
}
