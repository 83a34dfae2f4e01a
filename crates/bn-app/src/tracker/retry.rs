use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use log::{debug, warn};

/// Classifies an error as transient (worth another attempt) or terminal.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `step * n` before the n-th retry.
    Linear(Duration),
    /// Doubles from `initial` for each retry, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before the `retry`-th retry, counting from 1.
    pub fn delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match *self {
            Self::Fixed(delay) => delay,
            Self::Linear(step) => step.saturating_mul(retry),
            Self::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(retry - 1);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(500),
                max: Duration::from_secs(4),
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    /// Runs `op` until it succeeds, fails with a terminal error, or the
    /// attempts run out. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && err.is_retryable() => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying in {}ms",
                        attempt,
                        max_attempts,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        debug!("Giving up after {} attempts: {}", attempt, err);
                    }
                    return Err(err);
                }
            }
        }
    }
}
