//! Retries for the run-record write.
//!
//! The import transaction is never retried: a failed reconciliation is rolled
//! back and reported. Only the status write that follows it goes through
//! [`with_retry`], so a briefly busy database does not lose the outcome.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::DbError;

/// Exponential backoff for transient persistence errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each delay by up to a quarter so writers do not retry in step.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fails on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delays to sleep before each retry, in order.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + '_ {
        let cap = self.max_delay.as_nanos() as f64;
        (0..self.max_retries).map(move |attempt| {
            let grown = self.initial_delay.as_nanos() as f64
                * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
            let mut nanos = grown.min(cap);
            if self.jitter {
                nanos *= 1.0 + clock_fraction() * 0.25;
            }
            Duration::from_nanos(nanos.max(0.0) as u64)
        })
    }
}

/// A value in `[0, 1)` from the sub-second clock.
fn clock_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1000) / 1000.0
}

/// Runs `operation` until it succeeds, fails with an error that is not
/// transient, or the backoff schedule is used up. The last error is returned.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, DbError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let mut backoff = config.backoff();
    let mut attempts = 1u32;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation = %operation_name, attempts, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let delay = match backoff.next() {
            Some(delay) if err.is_transient() => delay,
            _ => {
                if attempts > 1 {
                    warn!(operation = %operation_name, attempts, error = %err, "Giving up");
                }
                return Err(err);
            }
        };
        warn!(
            operation = %operation_name,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient persistence error, retrying"
        );
        sleep(delay).await;
        attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    async fn count_calls(
        config: &RetryConfig,
        failures: u32,
        error: fn() -> DbError,
    ) -> (Result<u32, DbError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(config, "record_run", || {
            let counter = counter.clone();
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                if call < failures {
                    Err(error())
                } else {
                    Ok(call)
                }
            }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn test_backoff_schedule() {
        let config = RetryConfig {
            max_delay: Duration::from_millis(300),
            jitter: false,
            ..Default::default()
        };
        let delays: Vec<Duration> = config.backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
            ]
        );
        assert_eq!(RetryConfig::no_retry().backoff().count(), 0);
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig::default();
        for delay in config.backoff().take(1) {
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_config_from_yaml() {
        let config: RetryConfig =
            serde_yaml::from_str("max_retries: 5\ninitial_delay: 20ms\n").unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(20));
        assert_eq!(config.max_delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_recovers_from_busy_database() {
        let busy = || DbError::Busy("database is locked".to_string());
        let (result, calls) = count_calls(&fast(2), 2, busy).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (result, calls) =
            count_calls(&fast(2), 5, || DbError::Decode("bad".to_string())).await;
        assert!(matches!(result, Err(DbError::Decode(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_schedule_exhausted() {
        let (result, calls) = count_calls(&fast(2), 5, || DbError::PoolExhausted).await;
        assert!(matches!(result, Err(DbError::PoolExhausted)));
        assert_eq!(calls, 3);
    }
}
