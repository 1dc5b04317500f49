//! Bounded retry with exponential backoff.
//!
//! One [`RetryPolicy`] per failure kind (navigation, challenge, distance
//! API). The policy only decides *how often* and *how long to wait*; the
//! caller decides which errors are retryable.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

/// Returned when every attempt failed or a non-retryable error came back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            ..Self::default()
        }
    }

    /// No waiting between attempts. Handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the `failed`-th failed attempt (1-based).
    pub fn backoff(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }

    /// Run a blocking operation. `sleep` receives each backoff delay so the
    /// caller can make waits interruptible.
    pub fn run<T, E, F, R, S>(&self, what: &str, mut op: F, retryable: R, mut sleep: S) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
        S: FnMut(Duration),
        E: std::fmt::Display,
    {
        let max = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if attempt < max && retryable(&error) => {
                    let delay = self.backoff(attempt);
                    warn!(what, attempt, max, ?delay, %error, "attempt failed, retrying");
                    sleep(delay);
                    attempt += 1;
                }
                Err(error) => return Err(Exhausted { attempts: attempt, error }),
            }
        }
    }

    /// Async flavour of [`run`](Self::run), sleeping on the tokio timer.
    pub async fn run_async<T, E, F, Fut, R>(&self, what: &str, mut op: F, retryable: R) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < max && retryable(&error) => {
                    let delay = self.backoff(attempt);
                    warn!(what, attempt, max, ?delay, %error, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(Exhausted { attempts: attempt, error }),
            }
        }
    }
}
