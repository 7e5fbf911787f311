//! Retry policy for provider transfers.
//!
//! Uploads and downloads run inside a job on the serialized execution
//! context, so every moment spent backing off holds up the host's queue.
//! Delays therefore start short, stay capped, and the number of retries is
//! small.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use cloudsave_common::Result;

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(8);

/// How often a failed transfer is retried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    /// Retry transient failures up to `max_retries` times.
    pub const fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Give up after the first failure.
    pub const fn none() -> Self {
        Self::new(0)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `retry` (zero based), without jitter:
    /// 0.5s doubling up to 8s.
    fn nominal_delay(retry: u32) -> Duration {
        BASE_DELAY
            .checked_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
    }

    /// Delay before retry number `retry`, spread by up to 25% either way so
    /// several hosts sharing a backend do not retry in lockstep.
    pub fn backoff(&self, retry: u32) -> Duration {
        Self::nominal_delay(retry).mul_f64(0.75 + rand::random::<f64>() * 0.5)
    }

    /// Longest time a single transfer can spend waiting between attempts.
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.max_retries)
            .map(Self::nominal_delay)
            .sum::<Duration>()
            .mul_f64(1.25)
    }

    /// Run `transfer`, retrying errors that [`is_transient`] reports.
    ///
    /// `operation` and `object` only label the log lines.
    ///
    /// [`is_transient`]: cloudsave_common::Error::is_transient
    pub async fn run<F, Fut, T>(&self, operation: &str, object: &str, transfer: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;

        loop {
            let err = match transfer().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(operation, object, "Succeeded after {} retries", retry);
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if retry == self.max_retries {
                if retry > 0 {
                    warn!(operation, object, "Giving up after {} attempts: {}", retry + 1, err);
                }
                return Err(err);
            }

            let delay = self.backoff(retry);
            warn!(operation, object, "Attempt {} failed: {}; retrying in {:?}", retry + 1, err, delay);
            sleep(delay).await;
            retry += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
