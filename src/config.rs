//! Configuration surface for the execution core.
//!
//! Values are supplied by the embedding application (CLI flags, config
//! files); this module only defines the resolved shapes and defaults.

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_MAX_TURNS: u32 = 25;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 128;
pub const DEFAULT_MAX_PARSE_ATTEMPTS: u32 = 5;
pub const DEFAULT_HISTORY_MAX_TURNS: usize = 100;
/// Consecutive all-failing tool turns before the loop gives up.
pub const STUCK_TURN_THRESHOLD: u32 = 3;

// === Types ===

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    /// Initial backoff delay in seconds.
    pub initial_delay: f64,
    /// Ceiling on any single backoff delay, in seconds.
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 30.0,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // Clamp to a sane range to guard against NaN/negative from misconfigured values
        let delay = delay.clamp(0.0, 300.0);
        Duration::from_secs_f64(delay)
    }
}

/// Resolved core configuration, including defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum conversation turns before the loop aborts.
    pub max_turns: u32,
    /// Maximum tool executions in flight at once within a batch.
    pub max_concurrency: usize,
    /// Per-tool execution timeout in seconds.
    pub tool_timeout_secs: u64,
    /// Time-to-live for cached tool results, in seconds.
    pub cache_ttl_secs: u64,
    /// Hard cap on cached tool results.
    pub cache_max_entries: usize,
    /// Parse failures tolerated per extraction attempt before giving up.
    pub max_parse_attempts: u32,
    /// History length beyond which old turns are collapsed.
    pub history_max_turns: usize,
    /// Idle timeout while waiting for the next model stream chunk, in seconds.
    pub stream_chunk_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            max_parse_attempts: DEFAULT_MAX_PARSE_ATTEMPTS,
            history_max_turns: DEFAULT_HISTORY_MAX_TURNS,
            stream_chunk_timeout_secs: 90,
            retry: RetryPolicy::default(),
        }
    }
}

impl CoreConfig {
    #[must_use]
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn stream_chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_chunk_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            enabled: true,
            max_retries: 5,
            initial_delay: 1.0,
            max_delay: 4.0,
            exponential_base: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        // Capped at max_delay from here on.
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(4));
    }

    #[test]
    fn backoff_survives_misconfigured_values() {
        let policy = RetryPolicy {
            enabled: true,
            max_retries: 3,
            initial_delay: -10.0,
            max_delay: f64::NAN,
            exponential_base: 2.0,
        };
        let delay = policy.delay_for_attempt(1);
        assert!(delay <= Duration::from_secs(300));
    }

    #[test]
    fn config_defaults_are_bounded() {
        let config = CoreConfig::default();
        assert!(config.max_turns > 0);
        assert!(config.max_concurrency > 0);
        assert!(config.cache_max_entries > 0);
        assert_eq!(config.tool_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn config_deserializes_partial_input() {
        let parsed: CoreConfig =
            serde_json::from_str(r#"{"max_turns": 7, "retry": {"enabled": false, "max_retries": 0, "initial_delay": 0.5, "max_delay": 1.0, "exponential_base": 2.0}}"#)
                .unwrap();
        assert_eq!(parsed.max_turns, 7);
        assert!(!parsed.retry.enabled);
        assert_eq!(parsed.history_max_turns, DEFAULT_HISTORY_MAX_TURNS);
    }
}
