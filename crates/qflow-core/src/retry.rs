//! Bounded retry policies.
//!
//! One policy type serves every call site that retries: transient storage I/O
//! inside [`crate::store::ChunkStore`], chunk re-sends and reconnects in the
//! client. A policy allows a fixed number of attempts with either a fixed or
//! an exponentially growing delay, and then gives up.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// How the delay between attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `initial * factor^(retry - 1)`, capped at `max`.
    Exponential {
        /// Delay before the first retry
        initial: Duration,
        /// Upper bound of the delay
        max: Duration,
        /// Growth factor per retry
        factor: f64,
    },
}

/// Outcome of asking the policy what to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `retry` is the 1-based retry number.
    Retry {
        /// 1-based retry number
        retry: u32,
        /// Delay to wait first
        delay: Duration,
    },
    /// Attempts are exhausted.
    GiveUp,
}

/// A bounded retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(250), Duration::from_secs(15))
    }
}

impl RetryPolicy {
    /// Never retry.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
            jitter: false,
        }
    }

    /// Retry up to `max_retries` times with a constant delay.
    #[must_use]
    pub const fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
            jitter: false,
        }
    }

    /// Retry up to `max_retries` times, doubling the delay up to `max`.
    #[must_use]
    pub const fn exponential(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential {
                initial,
                max,
                factor: 2.0,
            },
            jitter: false,
        }
    }

    /// Spread delays by ±25% to avoid synchronized retries.
    #[must_use]
    pub const fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Maximum number of retries after the first attempt.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the given 1-based retry, without jitter.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let exp = retry.saturating_sub(1).min(63) as i32;
                let secs = initial.as_secs_f64() * factor.powi(exp);
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
        }
    }

    /// Decide what follows the `failures`-th consecutive failure.
    #[must_use]
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures == 0 || failures > self.max_retries {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.delay_for_retry(failures);
        if self.jitter && !delay.is_zero() {
            let spread = delay.as_secs_f64() * 0.25;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            delay = Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0));
        }

        RetryDecision::Retry {
            retry: failures,
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with an error `should_retry` rejects,
    /// or the policy gives up. The last error is returned on give-up.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if should_retry(&err) => {
                    failures += 1;
                    match self.decide(failures) {
                        RetryDecision::Retry { retry, delay } => {
                            tracing::debug!(retry, delay_ms = delay.as_millis() as u64, "Retrying");
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        RetryDecision::GiveUp => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
