//! # Reconnect Policy
//!
//! Exponential backoff with an attempt cap.
//!
//! ```text
//! delay(n) = min(initial * 2^(n-1), max)       n = 1, 2, 3, ...
//!
//! initial = 1s, max = 30s:
//!   attempt  1    2    3    4    5     6     7 ...
//!   delay    1s   2s   4s   8s   16s   30s   30s
//! ```
//!
//! No jitter. The schedule resets whenever the stream reaches `connected` or
//! the active endpoint changes.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

use crate::config::ConnectionSettings;

/// Backoff schedule plus attempt accounting.
#[derive(Debug)]
pub struct ReconnectPolicy {
    backoff: ExponentialBackoff,
    attempt: u32,
    max_attempts: u32,
}

impl ReconnectPolicy {
    /// `max_attempts` of 0 retries forever.
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        let backoff = ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            max_interval: max.max(initial),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        ReconnectPolicy {
            backoff,
            attempt: 0,
            max_attempts,
        }
    }

    /// Builds the policy from connection settings.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_secs(settings.max_backoff_secs),
            settings.max_reconnect_attempts,
        )
    }

    /// Schedules the next attempt. Returns its number and delay, or `None`
    /// once `max_attempts` have been used.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.backoff.next_backoff()?;
        self.attempt += 1;

        // Drop the sub-millisecond noise the backoff crate adds.
        Some((self.attempt, Duration::from_millis(delay.as_millis() as u64)))
    }

    /// Returns true when no attempts remain.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempt >= self.max_attempts
    }

    /// Attempts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempt cap (0 = unlimited).
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Back to attempt 0 and the initial delay.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempt = 0;
    }
}

/// Closed form of the schedule: `min(initial * 2^(attempt-1), max)`.
pub fn delay_for_attempt(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    initial
        .checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max.max(initial))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    #[test]
    fn test_default_schedule() {
        let mut policy = ReconnectPolicy::from_settings(&ConnectionSettings::default());
        let delays: Vec<Duration> = (0..8).map(|_| policy.next_attempt().unwrap().1).collect();
        assert_eq!(delays, secs(&[1, 2, 4, 8, 16, 30, 30, 30]));
    }

    #[test]
    fn test_schedule_matches_closed_form_and_is_monotonic() {
        let initial = Duration::from_millis(250);
        let max = Duration::from_secs(5);
        let mut policy = ReconnectPolicy::new(initial, max, 0);

        let mut previous = Duration::ZERO;
        for n in 1..=20 {
            let (attempt, delay) = policy.next_attempt().unwrap();
            assert_eq!(attempt, n);
            assert_eq!(delay, delay_for_attempt(initial, max, n));
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_attempt_cap_and_reset() {
        let mut policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 3);
        assert!(policy.next_attempt().is_some());
        assert!(policy.next_attempt().is_some());
        assert_eq!(policy.next_attempt().unwrap().0, 3);
        assert!(policy.is_exhausted());
        assert!(policy.next_attempt().is_none());

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert_eq!(
            policy.next_attempt(),
            Some((1, Duration::from_secs(1)))
        );
    }

    #[test]
    fn test_closed_form_saturates() {
        let max = Duration::from_secs(30);
        assert_eq!(delay_for_attempt(Duration::from_secs(1), max, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(Duration::from_secs(1), max, 5), Duration::from_secs(16));
        assert_eq!(delay_for_attempt(Duration::from_secs(1), max, 1000), max);
    }
}
