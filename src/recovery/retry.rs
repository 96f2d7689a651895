//! Bounded exponential-backoff retry.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::RecoveryError;

/// Jitter spread applied to every backoff delay (±20%).
pub const JITTER_SPREAD: f64 = 0.2;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Total attempts including the first one. At least 1.
    pub max_attempts: u32,
    /// Delay in milliseconds before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay. At least `base_delay_ms`.
    pub max_delay_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryOptions {
    pub fn validate(&self) -> Result<(), RecoveryError> {
        if self.max_attempts < 1 {
            return Err(RecoveryError::InvalidOptions(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(RecoveryError::InvalidOptions(format!(
                "max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1) * jitter, max)`.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self.base_delay_ms as f64 * 2f64.powi(exponent as i32) * jitter;
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }
}

pub(crate) fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range((1.0 - JITTER_SPREAD)..=(1.0 + JITTER_SPREAD))
}

/// Run `op` until it succeeds or `options.max_attempts` attempts have failed.
///
/// The first attempt runs immediately. Options are validated before anything
/// runs; an invalid triple is reported as [`RecoveryError::InvalidOptions`].
pub async fn retry_with_backoff<T, F, Fut>(
    mut op: F,
    options: &RetryOptions,
) -> Result<T, RecoveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    options.validate()?;

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= options.max_attempts => {
                tracing::warn!(attempts = attempt, error = %e, "retries exhausted");
                return Err(RecoveryError::Exhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                let delay = options.delay_for(attempt, jitter_factor());
                tracing::info!(
                    attempt,
                    max = options.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn opts(max_attempts: u32) -> RetryOptions {
        RetryOptions {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }

    #[test]
    fn exponential_backoff_without_jitter() {
        let o = opts(5);
        assert_eq!(o.delay_for(1, 1.0), Duration::from_millis(100));
        assert_eq!(o.delay_for(2, 1.0), Duration::from_millis(200));
        assert_eq!(o.delay_for(3, 1.0), Duration::from_millis(400));
        assert_eq!(o.delay_for(5, 1.0), Duration::from_millis(1000));
        assert_eq!(o.delay_for(40, 1.0), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let o = opts(3);
        for _ in 0..100 {
            let j = jitter_factor();
            assert!((0.8..=1.2).contains(&j));
            let d = o.delay_for(2, j).as_millis();
            assert!((160..=240).contains(&d));
        }
    }

    #[tokio::test]
    async fn invalid_options_fail_before_any_attempt() {
        let calls = AtomicU32::new(0);
        let bad = [
            RetryOptions {
                max_attempts: 0,
                ..opts(1)
            },
            RetryOptions {
                max_attempts: 2,
                base_delay_ms: 500,
                max_delay_ms: 100,
            },
        ];
        for options in &bad {
            let result = retry_with_backoff(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                },
                options,
            )
            .await;
            assert!(matches!(result, Err(RecoveryError::InvalidOptions(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_runs_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                anyhow::bail!("attempt {n} failed")
            },
            &opts(3),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert!(err.to_string().contains("attempt 3 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let value = retry_with_backoff(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 2 {
                    anyhow::bail!("transient");
                }
                Ok(n * 10)
            },
            &opts(3),
        )
        .await
        .unwrap();

        assert_eq!(value, 20);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // One backoff of 100ms ±20%.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(80));
        assert!(waited <= Duration::from_millis(130));
    }

    #[tokio::test]
    async fn first_attempt_runs_immediately() {
        let started = tokio::time::Instant::now();
        let value = retry_with_backoff(|| async { Ok::<_, anyhow::Error>(7) }, &opts(1))
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
