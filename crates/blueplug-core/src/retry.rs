//! Backoff schedules.
//!
//! A [`RetryConfig`] is a budget of retries plus an exponential delay
//! schedule capped at `max_delay`. The bridge uses one schedule per concern:
//!
//! - [`RetryConfig::for_reconnect`]: a session whose link was lost
//! - [`RetryConfig::for_read`]: a characteristic read that failed transiently,
//!   driven by [`with_retry`]
//! - [`RetryConfig::for_scan`]: restarting the scanner after the adapter went
//!   away
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use blueplug_core::{Error, RetryConfig, with_retry};
//!
//! # async fn example() -> Result<(), Error> {
//! let schedule = RetryConfig::new(3).initial_delay(Duration::from_millis(50));
//! let level = with_retry(&schedule, "read battery", || async { Ok::<_, Error>(87u8) }).await?;
//! assert_eq!(level, 87);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Largest fraction added on top of a delay when jitter is on.
const JITTER_FRACTION: f64 = 0.25;

/// Retry budget and backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay, jitter included.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Randomize delays upward by up to a quarter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::schedule(3, Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl RetryConfig {
    fn schedule(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Default schedule with a custom retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self::default().max_retries(max_retries)
    }

    /// Transient read failures: three quick retries.
    pub fn for_read() -> Self {
        Self::schedule(3, Duration::from_millis(100), Duration::from_secs(2))
    }

    /// Link loss: peripherals often need a few seconds to reset or come back
    /// into range, so delays start at 2 s and grow to a minute.
    pub fn for_reconnect() -> Self {
        Self::schedule(5, Duration::from_secs(2), Duration::from_secs(60))
    }

    /// Scanner restarts. Never exhausted.
    pub fn for_scan() -> Self {
        Self::schedule(u32::MAX, Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Set the retry budget.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the first delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Turn jitter on or off.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Whether `retry_count` retries have used up the budget.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Delay before retry number `attempt + 1`. Never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let grown =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt.min(63) as i32);
        let mut secs = if grown.is_finite() { grown.min(cap) } else { cap };

        if self.jitter {
            let spread = rand::rng().random::<f64>() * JITTER_FRACTION;
            secs = (secs * (1.0 + spread)).min(cap);
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Reject schedules that shrink or start above their cap.
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::invalid_config(format!(
                "initial_delay ({:?}) must not exceed max_delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Run `operation`, retrying timeouts and platform errors on `config`'s
/// schedule. Other errors, and the last failure once the budget is spent,
/// are returned as is.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, what: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0u32;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    debug!("{} succeeded after {} retries", what, retries);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !is_transient(&error) || config.is_exhausted(retries) {
            return Err(error);
        }
        let delay = config.delay_for_attempt(retries);
        retries += 1;
        warn!("{} failed: {} (retry {} in {:?})", what, error, retries, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Errors worth another try on the same link. A lost link is handled by
/// the session, not here.
fn is_transient(error: &Error) -> bool {
    matches!(error, Error::OperationTimeout { .. } | Error::Bluetooth(_))
}
