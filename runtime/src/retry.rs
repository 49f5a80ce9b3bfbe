//! Reconnect policy with exponential backoff.
//!
//! After a connection failure the bus waits `base_delay × 2^(attempt − 1)` before
//! attempt `attempt` (attempts are numbered from 1), up to `max_attempts`. Once
//! the attempts are used up the state is exhausted and nothing else is scheduled.
//!
//! # Example
//!
//! ```rust
//! use hometrip_events_runtime::retry::{ReconnectPolicy, ReconnectState};
//! use std::time::Duration;
//!
//! let policy = ReconnectPolicy::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(500))
//!     .build();
//!
//! let mut state = ReconnectState::new(&policy);
//! assert_eq!(state.next_attempt(), Some((1, Duration::from_millis(500))));
//! assert_eq!(state.next_attempt(), Some((2, Duration::from_millis(1000))));
//! assert_eq!(state.next_attempt(), Some((3, Duration::from_millis(2000))));
//! assert_eq!(state.next_attempt(), None);
//! assert!(state.is_exhausted());
//! ```

use std::time::Duration;

/// Reconnect policy configuration.
///
/// # Default Values
///
/// - `max_attempts`: 10
/// - `base_delay`: 1 second
/// - `max_delay`: none (the delay keeps doubling)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts after a failure
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Optional cap on the delay between attempts
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: None,
        }
    }
}

impl ReconnectPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> ReconnectPolicyBuilder {
        ReconnectPolicyBuilder {
            max_attempts: None,
            base_delay: None,
            max_delay: None,
        }
    }

    /// Calculate the delay before a given attempt (1-based).
    ///
    /// Uses exponential backoff: delay = base_delay * 2^(attempt - 1), saturating
    /// on overflow and capped at `max_delay` when one is set. Attempt 0 is
    /// treated as attempt 1.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = 2u32
            .checked_pow(exponent)
            .map_or(Duration::MAX, |factor| self.base_delay.saturating_mul(factor));

        match self.max_delay {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }

    /// The full delay schedule, one entry per attempt.
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }
}

/// Builder for [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl ReconnectPolicyBuilder {
    /// Set maximum number of reconnect attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay before the first attempt.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Cap the delay between attempts.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`ReconnectPolicy`].
    #[must_use]
    pub fn build(self) -> ReconnectPolicy {
        let defaults = ReconnectPolicy::default();
        ReconnectPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay,
        }
    }
}

/// Mutable reconnect bookkeeping.
///
/// Only the connection manager mutates this. It is reset to zero on every
/// successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    attempt: u32,
    policy: ReconnectPolicy,
}

impl ReconnectState {
    /// Fresh state for `policy`.
    #[must_use]
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            attempt: 0,
            policy: policy.clone(),
        }
    }

    /// Number of attempts made since the last successful connect.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Configured attempt limit.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Whether every attempt has been used.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    /// Claim the next attempt, returning its number and the delay to wait first.
    ///
    /// Returns `None` once exhausted.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, self.policy.delay_for_attempt(self.attempt)))
    }

    /// Back to zero after a successful connect.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = ReconnectPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
    }

    #[test]
    fn test_schedule_follows_formula() {
        let base = Duration::from_millis(250);
        let policy = ReconnectPolicy::builder()
            .max_attempts(10)
            .base_delay(base)
            .build();

        let schedule = policy.schedule();
        assert_eq!(schedule.len(), 10);
        for (n, delay) in (1u32..).zip(schedule) {
            assert_eq!(delay, base * 2u32.pow(n - 1));
        }
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = ReconnectPolicy::builder()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5))
            .build();

        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_defaults() {
        let policy = ReconnectPolicy::builder().build();
        assert_eq!(policy, ReconnectPolicy::default());
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert!(policy.max_delay.is_none());
    }

    #[test]
    fn test_state_exhausts_and_resets() {
        let policy = ReconnectPolicy::builder()
            .max_attempts(2)
            .base_delay(Duration::from_millis(10))
            .build();
        let mut state = ReconnectState::new(&policy);

        assert_eq!(state.next_attempt(), Some((1, Duration::from_millis(10))));
        assert_eq!(state.next_attempt(), Some((2, Duration::from_millis(20))));
        assert!(state.is_exhausted());
        assert_eq!(state.next_attempt(), None);
        assert_eq!(state.attempt(), 2);

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert!(!state.is_exhausted());
        assert_eq!(state.next_attempt(), Some((1, Duration::from_millis(10))));
    }

    #[test]
    fn test_zero_attempts_is_immediately_exhausted() {
        let policy = ReconnectPolicy::builder().max_attempts(0).build();
        let mut state = ReconnectState::new(&policy);
        assert!(state.is_exhausted());
        assert_eq!(state.next_attempt(), None);
    }
}
