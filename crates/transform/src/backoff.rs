//! Poll cadence and error backoff for export jobs.
//!
//! A healthy job is polled after [`PollConfig::initial_delay`] and then on
//! every [`PollConfig::interval`]. Consecutive failed polls stretch the wait
//! exponentially up to [`PollConfig::max_error_delay`]; after
//! [`PollConfig::max_consecutive_errors`] failures in a row the poller stops.

use std::time::Duration;

/// Tunable parameters for job polling.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Delay before the first status request of a poller.
    pub initial_delay: Duration,
    /// Steady delay between successful polls.
    pub interval: Duration,
    /// Factor by which the delay grows after each failed poll.
    pub error_multiplier: f64,
    /// Upper bound on the delay after failed polls.
    pub max_error_delay: Duration,
    /// Consecutive failures tolerated before polling is abandoned.
    /// `None` keeps retrying forever.
    pub max_consecutive_errors: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_secs(4),
            error_multiplier: 2.0,
            max_error_delay: Duration::from_secs(60),
            max_consecutive_errors: Some(10),
        }
    }
}

impl PollConfig {
    /// Delay before the next poll given the current error streak.
    ///
    /// A streak of zero yields the steady interval.
    pub fn delay_after(&self, consecutive_errors: u32) -> Duration {
        let mut delay = self.interval;
        for _ in 0..consecutive_errors {
            delay = next_delay(delay, self);
            if delay >= self.max_error_delay {
                break;
            }
        }
        delay
    }

    /// Whether `consecutive_errors` has used up the retry allowance.
    pub fn exhausted(&self, consecutive_errors: u32) -> bool {
        self.max_consecutive_errors
            .is_some_and(|max| consecutive_errors >= max)
    }
}

/// Grow `current` by the error multiplier.
///
/// The result is clamped to [`PollConfig::max_error_delay`], but never
/// drops below the steady interval.
pub fn next_delay(current: Duration, config: &PollConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.error_multiplier) as u64;
    Duration::from_millis(next_ms)
        .min(config.max_error_delay)
        .max(config.interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_polls_use_interval() {
        let config = PollConfig::default();
        assert_eq!(config.delay_after(0), Duration::from_secs(4));
    }

    #[test]
    fn error_delay_doubles() {
        let config = PollConfig::default();
        assert_eq!(next_delay(Duration::from_secs(4), &config), Duration::from_secs(8));
    }

    #[test]
    fn error_delay_is_capped() {
        let config = PollConfig {
            max_error_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(8), &config), Duration::from_secs(10));
    }

    #[test]
    fn delays_for_growing_error_streak() {
        let config = PollConfig::default();
        let expected = [4, 8, 16, 32, 60, 60, 60];

        for (streak, &expected_secs) in expected.iter().enumerate() {
            assert_eq!(config.delay_after(streak as u32).as_secs(), expected_secs);
        }
    }

    #[test]
    fn multiplier_is_configurable() {
        let config = PollConfig {
            error_multiplier: 3.0,
            ..Default::default()
        };
        assert_eq!(config.delay_after(1), Duration::from_secs(12));
    }

    #[test]
    fn retry_allowance() {
        let config = PollConfig {
            max_consecutive_errors: Some(3),
            ..Default::default()
        };
        assert!(!config.exhausted(2));
        assert!(config.exhausted(3));

        let forever = PollConfig {
            max_consecutive_errors: None,
            ..Default::default()
        };
        assert!(!forever.exhausted(u32::MAX));
    }
}
