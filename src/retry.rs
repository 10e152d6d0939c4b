//! Reconnect policy for the message channel.
//!
//! Reconnection is bounded and fires only on unexpected close/error while
//! auto-reconnect is enabled, never after an explicit disconnect. Exceeding
//! the maximum stops retrying silently; the caller only learns through the
//! last error event.

use std::time::Duration;

use tracing::debug;

/// Policy controlling reconnect attempts for one transport worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts after an unexpected close.
    pub max_attempts: u32,
    /// Fixed delay applied before each reconnect attempt.
    pub interval: Duration,
    /// Whether reconnection is armed at all.
    pub enabled: bool,
}

impl ReconnectPolicy {
    /// Disables reconnection entirely.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Creates a tracker with a fresh attempt counter.
    pub fn tracker(&self) -> ReconnectTracker {
        ReconnectTracker {
            policy: self.clone(),
            attempts: 0,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(1),
            enabled: true,
        }
    }
}

/// Attempt counter owned by one transport worker.
#[derive(Clone, Debug)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectTracker {
    /// Registers one more attempt and returns the delay to wait before it,
    /// or `None` once the policy is exhausted or disabled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.enabled || self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        debug!(
            event = "reconnect_scheduled",
            attempt = self.attempts,
            max_attempts = self.policy.max_attempts,
            delay_ms = self.policy.interval.as_millis() as u64,
        );
        Some(self.policy.interval)
    }

    /// Resets the counter after a successful reopen.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReconnectPolicy;

    #[test]
    fn stops_after_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(10),
            enabled: true,
        };
        let mut tracker = policy.tracker();

        assert_eq!(tracker.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(tracker.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(tracker.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(tracker.next_delay(), None);
        assert_eq!(tracker.next_delay(), None);
        assert_eq!(tracker.attempts(), 3);
    }

    #[test]
    fn reset_restores_the_full_budget() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            interval: Duration::from_millis(5),
            enabled: true,
        };
        let mut tracker = policy.tracker();

        assert!(tracker.next_delay().is_some());
        assert!(tracker.next_delay().is_some());
        assert!(tracker.next_delay().is_none());

        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
        assert!(tracker.next_delay().is_some());
    }

    #[test]
    fn disabled_policy_never_schedules() {
        let mut tracker = ReconnectPolicy::disabled().tracker();
        assert!(tracker.next_delay().is_none());
    }
}
