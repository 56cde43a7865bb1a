//! Connect retry policy.
//!
//! Exponential backoff with jitter, bounded both by attempt count and by a
//! total wall-clock budget. A lab that is mid-reboot can take minutes to
//! accept connections again, so the time budget is usually the binding limit.

use std::time::Duration;

/// Retry policy for establishing a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    /// Base delay between retries (exponential backoff).
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied to delay.
    pub jitter: f64,
    /// Give up once this much time has passed since the first attempt.
    pub retry_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            retry_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fixed interval retries until `retry_timeout` elapses.
    pub fn fixed(interval: Duration, retry_timeout: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: interval,
            max_delay: interval,
            jitter: 0.0,
            retry_timeout,
        }
    }

    /// Calculate backoff delay for a given attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_secs = self.base_delay.as_secs_f64();
        let max_secs = self.max_delay.as_secs_f64().max(0.0);

        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1)) as f64;
        let mut delay = (base_secs * multiplier).min(max_secs);

        if self.jitter > 0.0 && delay > 0.0 {
            let jitter = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            delay = (delay * (1.0 + jitter)).max(0.0);
        }

        Duration::from_secs_f64(delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempt` failures and
    /// `elapsed` time, assuming the next delay is `next_delay`.
    pub fn should_retry(&self, attempt: u32, elapsed: Duration, next_delay: Duration) -> bool {
        attempt < self.max_attempts() && elapsed + next_delay < self.retry_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            retry_timeout: Duration::from_secs(300),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.backoff_delay(1).as_secs_f64();
            assert!((8.0..=12.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_should_retry_respects_time_budget() {
        let policy = RetryPolicy::fixed(Duration::from_secs(3), Duration::from_secs(10));
        assert!(policy.should_retry(1, Duration::from_secs(0), Duration::from_secs(3)));
        assert!(!policy.should_retry(4, Duration::from_secs(9), Duration::from_secs(3)));
    }

    #[test]
    fn test_once_never_retries() {
        let policy = RetryPolicy::once();
        assert!(!policy.should_retry(1, Duration::ZERO, Duration::ZERO));
        assert_eq!(policy.max_attempts(), 1);
    }
}
