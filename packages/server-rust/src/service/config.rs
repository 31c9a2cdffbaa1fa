use std::time::Duration;

use crate::storage::ExpiryPolicy;

/// What a caller sees when its command id is already `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InProgressPolicy {
    /// Answer 409 immediately; the caller retries later.
    #[default]
    Reject,
    /// Poll the store until the command is terminal, then replay it.
    /// Answers 409 if `timeout` elapses first.
    Wait {
        timeout: Duration,
        poll_interval: Duration,
    },
}

/// Server-level configuration for the invocation pipeline.
///
/// Controls invocation timeouts, concurrency limits, error-detail visibility
/// and idempotency bookkeeping.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Timeout applied to each invocation in milliseconds.
    pub default_invocation_timeout_ms: u64,
    /// Maximum number of concurrent invocations before load shedding.
    pub max_concurrent_invocations: u32,
    /// Attach inner errors, stack traces and error types to failures.
    pub include_error_details: bool,
    pub in_progress_policy: InProgressPolicy,
    /// Assign an id to HTTP commands that arrive without one.
    pub generate_missing_command_ids: bool,
    /// How long terminal commands are kept before the sweeper removes them.
    pub command_retention_ms: u64,
    /// How long a command may stay `InProgress` before the sweeper treats it
    /// as abandoned. Must exceed the invocation timeout.
    pub in_progress_ttl_ms: u64,
    /// Interval between expiry sweeps in milliseconds.
    pub sweep_interval_ms: u64,
}

impl ServerConfig {
    #[must_use]
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.default_invocation_timeout_ms)
    }

    #[must_use]
    pub fn command_retention(&self) -> Duration {
        Duration::from_millis(self.command_retention_ms)
    }

    #[must_use]
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            retention: self.command_retention(),
            in_progress_ttl: Duration::from_millis(self.in_progress_ttl_ms),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_invocation_timeout_ms: 30_000,
            max_concurrent_invocations: 1000,
            include_error_details: false,
            in_progress_policy: InProgressPolicy::default(),
            generate_missing_command_ids: false,
            command_retention_ms: 24 * 60 * 60 * 1000,
            in_progress_ttl_ms: 10 * 60 * 1000,
            sweep_interval_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hide_details_and_reject_in_progress() {
        let config = ServerConfig::default();
        assert!(!config.include_error_details);
        assert_eq!(config.in_progress_policy, InProgressPolicy::Reject);
        assert_eq!(config.invocation_timeout(), Duration::from_secs(30));
        assert_eq!(config.command_retention(), Duration::from_secs(86_400));
        assert!(config.expiry_policy().in_progress_ttl > config.invocation_timeout());
    }
}
