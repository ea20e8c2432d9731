use std::time::Duration;

use crate::config::SchedulerSettings;

/// Retry limits and exponential backoff for failed jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed executions allowed before a job becomes terminal.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for RetryPolicy {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay_ms: settings.retry_base_delay_ms,
            max_backoff_ms: settings.retry_max_delay_ms,
        }
    }
}

/// Computes the backoff after the given number of failed attempts.
///
/// Formula: delay = min(base_delay * 2^(attempts-1), max_backoff)
pub fn compute_retry_delay(attempts: u32, policy: &RetryPolicy) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }

    let exp = attempts.saturating_sub(1).min(62);
    let scaled = policy.base_delay_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(scaled.min(policy.max_backoff_ms))
}

/// Returns true when attempts >= max_attempts.
pub fn is_exhausted(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

/// What to do with an entry after a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return to pending after `delay`.
    RetryAfter { delay: Duration },
    /// Move to the failed record store.
    Terminal,
}

/// Decides the fate of an entry that has now failed `attempts` times.
///
/// A `requested` delay from the executor only ever lengthens the backoff,
/// and never past `max_backoff_ms`. Waits longer than that belong in
/// `JobOutcome::Deferred`.
pub fn decide(attempts: u32, requested: Option<Duration>, policy: &RetryPolicy) -> RetryDecision {
    if is_exhausted(attempts, policy.max_attempts) {
        return RetryDecision::Terminal;
    }
    let backoff = compute_retry_delay(attempts, policy);
    let ceiling = Duration::from_millis(policy.max_backoff_ms);
    RetryDecision::RetryAfter {
        delay: requested.map_or(backoff, |requested| requested.min(ceiling).max(backoff)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_backoff_ms: 300_000,
        };

        assert_eq!(compute_retry_delay(0, &policy), Duration::ZERO);
        assert_eq!(compute_retry_delay(1, &policy), Duration::from_secs(1));
        assert_eq!(compute_retry_delay(2, &policy), Duration::from_secs(2));
        assert_eq!(compute_retry_delay(3, &policy), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay_ms: 1000,
            max_backoff_ms: 5000,
        };

        assert_eq!(compute_retry_delay(10, &policy), Duration::from_secs(5));
        assert_eq!(compute_retry_delay(u32::MAX, &policy), Duration::from_secs(5));
    }

    #[test]
    fn exhaustion_is_inclusive() {
        assert!(!is_exhausted(0, 5));
        assert!(!is_exhausted(4, 5));
        assert!(is_exhausted(5, 5));
        assert!(is_exhausted(6, 5));
    }

    #[test]
    fn fifth_failure_of_five_is_terminal() {
        let policy = RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        };

        for attempts in 1..5 {
            assert!(matches!(
                decide(attempts, None, &policy),
                RetryDecision::RetryAfter { .. }
            ));
        }
        assert_eq!(decide(5, None, &policy), RetryDecision::Terminal);
    }

    #[test]
    fn requested_delay_only_lengthens() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10_000,
            max_backoff_ms: 60_000,
        };

        assert_eq!(
            decide(1, Some(Duration::from_secs(1)), &policy),
            RetryDecision::RetryAfter {
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            decide(1, Some(Duration::from_secs(45)), &policy),
            RetryDecision::RetryAfter {
                delay: Duration::from_secs(45)
            }
        );
    }

    #[test]
    fn requested_delay_is_capped_at_max_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10_000,
            max_backoff_ms: 60_000,
        };

        assert_eq!(
            decide(1, Some(Duration::from_secs(90)), &policy),
            RetryDecision::RetryAfter {
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(
            decide(4, Some(Duration::from_secs(3600)), &policy),
            RetryDecision::RetryAfter {
                delay: Duration::from_secs(60)
            }
        );
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_up_to_ceiling(
            base in 1u64..60_000,
            max in 1u64..3_600_000,
            attempts in 1u32..64,
        ) {
            let policy = RetryPolicy { max_attempts: u32::MAX, base_delay_ms: base, max_backoff_ms: max };
            let current = compute_retry_delay(attempts, &policy);
            let next = compute_retry_delay(attempts + 1, &policy);
            prop_assert!(next >= current);
            prop_assert!(next <= Duration::from_millis(max));
        }
    }
}
