// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resubscription policy used by the `retry_with` operators.
//!
//! A [`RetryPolicy`] decides how many times a failed source is resubscribed
//! and how long the operator waits (on a scheduler worker) before each
//! attempt.

use super::{FlowError, FlowResult};
use crate::core::config::FlatConfig;
use std::time::Duration;

/// Backoff strategy for resubscription delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackoffStrategy {
    /// delay = initial_delay * 2^(attempt-1)
    #[default]
    Exponential,

    /// delay = initial_delay * attempt
    Linear,

    /// delay = initial_delay
    Fixed,
}

impl BackoffStrategy {
    /// Parse backoff strategy from string (case-insensitive)
    pub fn parse(s: &str) -> FlowResult<Self> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "fixed" => Ok(BackoffStrategy::Fixed),
            _ => Err(FlowError::invalid_parameter(
                "retry.backoff",
                format!(
                    "Invalid backoff strategy '{}'. Valid values: 'exponential', 'linear', 'fixed'",
                    s
                ),
            )),
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Fixed => "fixed",
        }
    }
}

/// Resubscription policy with backoff settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of resubscriptions
    pub max_attempts: usize,

    pub backoff: BackoffStrategy,

    /// Delay before the first resubscription
    pub initial_delay: Duration,

    /// Upper bound for any computed delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        backoff: BackoffStrategy,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> FlowResult<Self> {
        if max_attempts == 0 {
            return Err(FlowError::invalid_parameter(
                "max_attempts",
                "max_attempts must be greater than 0",
            ));
        }

        if initial_delay > max_delay {
            return Err(FlowError::invalid_parameter(
                "initial_delay",
                "initial_delay cannot be greater than max_delay",
            ));
        }

        Ok(Self {
            max_attempts,
            backoff,
            initial_delay,
            max_delay,
        })
    }

    /// Resubscribe immediately, at most `max_attempts` times
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Parse a policy from `retry.*` keys
    ///
    /// Defaults: 3 attempts, exponential backoff, 100ms initial delay, 30s cap.
    pub fn from_flat_config(config: &FlatConfig) -> FlowResult<Self> {
        let max_attempts = config
            .get("retry.max-attempts")
            .map(|s| {
                s.parse::<usize>().map_err(|_| {
                    FlowError::invalid_parameter(
                        "retry.max-attempts",
                        "must be a positive integer",
                    )
                })
            })
            .transpose()?
            .unwrap_or(3);

        let backoff = config
            .get("retry.backoff")
            .map(BackoffStrategy::parse)
            .transpose()?
            .unwrap_or_default();

        let initial_delay = config
            .get("retry.initial-delay")
            .map(parse_duration)
            .transpose()?
            .unwrap_or(Duration::from_millis(100));

        let max_delay = config
            .get("retry.max-delay")
            .map(parse_duration)
            .transpose()?
            .unwrap_or(Duration::from_secs(30));

        Self::new(max_attempts, backoff, initial_delay, max_delay)
    }

    /// Delay before resubscription number `attempt` (1-indexed)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                let multiplier = 2u32.saturating_pow((attempt - 1).min(31) as u32);
                self.initial_delay.saturating_mul(multiplier)
            }
            BackoffStrategy::Linear => self
                .initial_delay
                .saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX)),
            BackoffStrategy::Fixed => self.initial_delay,
        };
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed for `error` after `attempts` tries
    pub fn should_retry(&self, attempts: usize, error: &FlowError) -> bool {
        error.is_retriable() && attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Parse duration from string
///
/// Supports "100ms", "1s", "2m" and bare numbers (milliseconds).
pub fn parse_duration(s: &str) -> FlowResult<Duration> {
    let s = s.trim();
    let invalid = |what: &str| {
        FlowError::invalid_parameter("duration", format!("Invalid duration '{}': {}", s, what))
    };

    if let Some(stripped) = s.strip_suffix("ms") {
        let millis = stripped
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("expected number before 'ms'"))?;
        return Ok(Duration::from_millis(millis));
    }

    if let Some(stripped) = s.strip_suffix('s') {
        let secs = stripped
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("expected number before 's'"))?;
        return Ok(Duration::from_secs(secs));
    }

    if let Some(stripped) = s.strip_suffix('m') {
        let mins = stripped
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("expected number before 'm'"))?;
        return Ok(Duration::from_secs(mins * 60));
    }

    let millis = s
        .parse::<u64>()
        .map_err(|_| invalid("expected number or duration with suffix (ms, s, m)"))?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PropertySource;

    #[test]
    fn test_backoff_strategy_parse() {
        assert_eq!(
            BackoffStrategy::parse("Linear").unwrap(),
            BackoffStrategy::Linear
        );
        assert!(BackoffStrategy::parse("random").is_err());
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy::new(
            10,
            BackoffStrategy::Exponential,
            Duration::from_millis(100),
            Duration::from_millis(500),
        )
        .unwrap();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(64), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = RetryPolicy::new(
            5,
            BackoffStrategy::Linear,
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(linear.delay_for(3), Duration::from_millis(30));

        let fixed = RetryPolicy::immediate(2);
        assert_eq!(fixed.delay_for(2), Duration::ZERO);
    }

    #[test]
    fn test_invalid_policy() {
        assert!(RetryPolicy::new(
            0,
            BackoffStrategy::Fixed,
            Duration::ZERO,
            Duration::ZERO
        )
        .is_err());
        assert!(RetryPolicy::new(
            1,
            BackoffStrategy::Fixed,
            Duration::from_secs(2),
            Duration::from_secs(1)
        )
        .is_err());
    }

    #[test]
    fn test_from_flat_config() {
        let mut config = FlatConfig::new();
        config.set("retry.max-attempts", "5", PropertySource::Programmatic);
        config.set("retry.backoff", "fixed", PropertySource::Programmatic);
        config.set("retry.initial-delay", "250ms", PropertySource::Programmatic);
        let policy = RetryPolicy::from_flat_config(&config).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff, BackoffStrategy::Fixed);
        assert_eq!(policy.delay_for(4), Duration::from_millis(250));
    }

    #[test]
    fn test_should_retry_respects_category() {
        let policy = RetryPolicy::immediate(2);
        assert!(policy.should_retry(1, &FlowError::callback("x")));
        assert!(!policy.should_retry(2, &FlowError::callback("x")));
        assert!(!policy.should_retry(0, &FlowError::bad_request(0)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_millis(42));
        assert!(parse_duration("abc").is_err());
    }
}
