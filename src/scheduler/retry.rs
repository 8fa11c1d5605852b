//! Retry policy with exponential backoff.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default number of attempts per task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay after the first failed attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// How many times a task is attempted and how long to wait in between.
///
/// The delay doubles after each failure: 1s, 2s, 4s... There is no wait after
/// the final attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// Returned when a backoff wait is interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffCancelled;

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Every delay a task that always fails will go through.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.delay_after(a)).collect()
    }

    /// Sleeps for the backoff after `attempt`, returning early on cancellation.
    pub async fn backoff(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), BackoffCancelled> {
        if cancel.is_cancelled() {
            return Err(BackoffCancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.delay_after(attempt)) => Ok(()),
            _ = cancel.cancelled() => Err(BackoffCancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn test_schedule_has_no_wait_after_last_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.schedule(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_large_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert_eq!(policy.delay_after(90), Duration::from_secs(1 << 16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_for_delay() {
        let policy = RetryPolicy::default();
        let started = tokio::time::Instant::now();
        policy.backoff(2, &CancellationToken::new()).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stops_on_cancel() {
        let policy = RetryPolicy::new(3, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        assert_eq!(policy.backoff(1, &cancel).await, Err(BackoffCancelled));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_backoff_refuses_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            RetryPolicy::default().backoff(1, &cancel).await,
            Err(BackoffCancelled)
        );
    }
}
