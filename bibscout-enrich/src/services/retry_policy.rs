//! Exponential backoff with jitter around one outbound operation
//!
//! The policy never touches the rate limiter itself; callers acquire a permit
//! inside the operation so every attempt is rate limited on its own.

use bibscout_common::config::RetryConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How an error should be treated by [`RetryPolicy::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Timeouts, connection resets, 5xx
    Transient,
    /// Explicit slow-down signal from the target; retried with a widened delay
    RateLimited,
    /// Unparseable response; retried a limited number of times
    Malformed,
    /// Never retried
    Fatal,
}

/// Errors that know their retry class
pub trait Classify {
    fn retry_class(&self) -> RetryClass;

    /// True when the error reports run cancellation rather than a failure
    fn is_cancellation(&self) -> bool {
        false
    }
}

/// Successful result plus the number of attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Final error plus the number of attempts made
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    /// Gave up because the run was cancelled, not because retries ran out
    pub cancelled: bool,
}

/// Retry driver configured from [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Attempt budget for an error class
    pub fn max_attempts_for(&self, class: RetryClass) -> u32 {
        let max = self.config.max_attempts.max(1);
        match class {
            RetryClass::Fatal => 1,
            RetryClass::Malformed => self.config.malformed_max_attempts.clamp(1, max),
            RetryClass::Transient | RetryClass::RateLimited => max,
        }
    }

    /// Delay before retrying after the given zero-based attempt, without jitter
    ///
    /// `base * factor^attempt`, multiplied for rate-limit signals, capped at
    /// `max_delay`.
    pub fn nominal_delay(&self, attempt: u32, class: RetryClass) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let mut delay_ms = base * self.config.backoff_factor.powi(attempt.min(63) as i32);
        if class == RetryClass::RateLimited {
            delay_ms *= self.config.rate_limit_multiplier;
        }
        let capped = delay_ms.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Nominal delay with ±`jitter_ratio` applied, still capped at `max_delay`
    pub fn backoff_delay(&self, attempt: u32, class: RetryClass) -> Duration {
        let nominal = self.nominal_delay(attempt, class).as_millis() as f64;
        let ratio = self.config.jitter_ratio;
        let jitter = if ratio > 0.0 {
            rand::thread_rng().gen_range(-ratio..=ratio)
        } else {
            0.0
        };
        let jittered = (nominal * (1.0 + jitter)).min(self.config.max_delay_ms as f64);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails fatally, runs out of attempts, or the
    /// run is cancelled
    ///
    /// `op` receives the zero-based attempt number. Backoff sleeps abort as
    /// soon as `cancel` fires.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Attempted<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut attempt = 0u32;

        loop {
            let result = op(attempt).await;
            let attempts = attempt + 1;

            let error = match result {
                Ok(value) => return Ok(Attempted { value, attempts }),
                Err(error) => error,
            };

            if error.is_cancellation() {
                return Err(RetryFailure {
                    error,
                    attempts,
                    cancelled: true,
                });
            }

            let class = error.retry_class();
            if attempts >= self.max_attempts_for(class) {
                tracing::debug!(
                    attempts,
                    class = ?class,
                    error = %error,
                    "Giving up after final attempt"
                );
                return Err(RetryFailure {
                    error,
                    attempts,
                    cancelled: false,
                });
            }

            let delay = self.backoff_delay(attempt, class);
            tracing::debug!(
                attempt = attempts,
                class = ?class,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after backoff"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        error,
                        attempts,
                        cancelled: true,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
