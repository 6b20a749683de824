//! Bounded retry with linear backoff for gateway dispatches.
//!
//! Attempts are strictly sequential. Between attempts the executor waits
//! `base_delay * attempt` (attempt is 1-based) on the tokio timer, so a
//! pending retry never occupies a thread. Cancelling the supplied token while
//! the executor is waiting aborts the loop without further attempts.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{is_retryable, GatewayError, Result};

/// Default maximum number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay multiplied by the attempt number.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Base backoff, multiplied by the 1-based attempt number (default: 1000ms).
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following failed attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Outcome of a retry loop.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// An attempt succeeded.
    Success {
        /// The value produced by the successful attempt.
        value: T,
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// All `max_retries + 1` attempts failed.
    Exhausted {
        /// The error of the final attempt.
        last_error: GatewayError,
        /// Total number of attempts made.
        attempts: u32,
    },
    /// The token was cancelled during a backoff wait.
    Interrupted {
        /// The error of the attempt preceding the wait.
        last_error: GatewayError,
        /// Total number of attempts made.
        attempts: u32,
    },
    /// A non-retryable error ended the loop immediately.
    Permanent {
        /// The error returned by the attempt.
        error: GatewayError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

/// Executor for retry loops.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails permanently, exhausts the
    /// retry budget or `cancel` fires during a backoff wait.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => {
                    debug!(attempt, "dispatch attempt succeeded");
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                return RetryOutcome::Permanent {
                    error,
                    attempts: attempt,
                };
            }

            warn!(attempt, error = %error, "dispatch attempt failed");

            if attempt > self.config.max_retries {
                return RetryOutcome::Exhausted {
                    last_error: error,
                    attempts: attempt,
                };
            }

            let backoff = self.config.delay_for(attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome::Interrupted {
                        last_error: error,
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn transient() -> GatewayError {
        GatewayError::communication("svc://x", "connection reset")
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_backoff() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for(3), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute(&CancellationToken::new(), move |_| {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, GatewayError>("success")
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Success {
                value: "success",
                attempts: 1
            }
        ));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let executor = RetryExecutor::default();

        let outcome = executor
            .execute(&CancellationToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(transient())
                } else {
                    Ok("success")
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Success {
                value: "success",
                attempts: 3
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_with_linear_delays() {
        let executor = RetryExecutor::default();
        let started = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        let outcome: RetryOutcome<()> = executor
            .execute(&CancellationToken::new(), move |_| {
                seen_clone.lock().unwrap().push(started.elapsed());
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted {
                last_error: GatewayError::Communication { .. },
                attempts: 4
            }
        ));

        let seen = seen.lock().unwrap();
        let offsets: Vec<u64> = seen.iter().map(|d| d.as_millis() as u64).collect();
        // delays of 1s, 2s, 3s between the four attempts
        assert_eq!(offsets, vec![0, 1000, 3000, 6000]);
    }

    #[tokio::test]
    async fn test_retry_no_retry_on_permanent_error() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute(&CancellationToken::new(), move |_| {
                counter_clone.fetch_add(1, Ordering::Relaxed);
                async { Err(GatewayError::Configuration("no reply topic".to_string())) }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Permanent {
                error: GatewayError::Configuration(_),
                attempts: 1
            }
        ));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_interrupts() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let counter_clone = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute(&cancel, move |_| {
                counter_clone.fetch_add(1, Ordering::Relaxed);
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Interrupted { attempts: 1, .. }
        ));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
