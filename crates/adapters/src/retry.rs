use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::AdapterError;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub sleep: Duration,
    /// Base of the exponential back-off after a provider rate limit, and the
    /// margin added to a server-supplied retry delay.
    pub rate_limit_backoff: Duration,
}

impl RetryConfig {
    /// Rate-limit back-off starts at `sleep`.
    pub const fn new(max_retries: usize, sleep: Duration) -> Self {
        Self {
            max_retries,
            sleep,
            rate_limit_backoff: sleep,
        }
    }

    pub const fn with_rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    /// A single attempt, used by connectivity probes.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn attempts(&self) -> usize {
        self.max_retries.max(1)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2)).with_rate_limit_backoff(RATE_LIMIT_BACKOFF)
    }
}

/// Runs `f` up to `config.max_retries` times, sleeping between attempts.
/// Permanent errors stop the loop immediately and are returned unwrapped.
pub fn call_with_retry<F, T>(mut f: F, config: &RetryConfig) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let attempts = config.attempts();
    let mut last_error = None;

    for attempt in 1..=attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_permanent() => return Err(err),
            Err(err) => {
                warn!("[call_with_retry] attempt {attempt}/{attempts} failed: {err}");
                if attempt < attempts && !config.sleep.is_zero() {
                    thread::sleep(config.sleep);
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(attempts, err))
}
