//! Retry eligibility and backoff schedules.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, ApiErrorKind};
use crate::rate_limit::RateLimitInfo;

/// Backoff strategy for retrying failed requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Uses an exponential delay between retries.
    ///
    /// The delay is calculated as `base * (factor ^ attempt)`, capped at `max`.
    Exponential {
        /// The initial backoff duration.
        base: Duration,
        /// The multiplicative factor for each subsequent retry.
        factor: f64,
        /// The maximum duration to wait between retries, before jitter.
        max: Duration,
        /// Whether to add up to 50% random jitter on top of the delay.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Calculate the delay for a given retry attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The retry attempt number (0-based)
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let scale = factor.powi(attempt.min(i32::MAX as u32) as i32);
                let seconds = base.as_secs_f64() * scale;
                let capped_seconds = seconds.min(max.as_secs_f64()).max(0.0);

                let mut delay = Duration::from_secs_f64(capped_seconds);

                // Jitter only ever lengthens the delay so concurrent clients spread out
                if jitter {
                    let jitter_ms = delay.as_millis() as u64 / 2;
                    delay += Duration::from_millis(fastrand::u64(0..=jitter_ms));
                }

                delay
            }
        }
    }
}

/// Dedicated schedule for 429 responses.
///
/// With a reset timestamp the delay is `time_until_reset + reset_buffer`, capped at
/// `max_delay`. Without one it falls back to `fallback_base * 2^attempt`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitRetry {
    pub max_retries: u32,
    pub reset_buffer: Duration,
    pub max_delay: Duration,
    pub fallback_base: Duration,
}

impl Default for RateLimitRetry {
    fn default() -> Self {
        Self {
            max_retries: 2,
            reset_buffer: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            fallback_base: Duration::from_secs(60),
        }
    }
}

impl RateLimitRetry {
    pub fn delay(&self, attempt: u32, info: Option<&RateLimitInfo>) -> Duration {
        if let Some(until_reset) = info.and_then(RateLimitInfo::time_until_reset) {
            let seconds = until_reset.as_seconds_f64() + self.reset_buffer.as_secs_f64();
            let capped = seconds.min(self.max_delay.as_secs_f64()).max(0.0);
            return Duration::from_secs_f64(capped);
        }

        let scale = 2_f64.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.fallback_base.as_secs_f64() * scale).unwrap_or(Duration::MAX)
    }
}

/// Retry budget and eligibility rules for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// When set, 429 responses are retried on their own schedule instead of surfacing.
    pub rate_limit: Option<RateLimitRetry>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            rate_limit: None,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with the default exponential backoff.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Create a retry policy with fixed backoff.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    /// Disable retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Decides whether the failure of retry number `retries_so_far` (0-based) is
    /// retried, returning the delay to wait first.
    ///
    /// Nothing is retried once the caller's token has fired.
    pub fn next_delay(
        &self,
        error: &ApiError,
        retries_so_far: u32,
        cancel: &CancellationToken,
    ) -> Option<Duration> {
        if cancel.is_cancelled() {
            return None;
        }

        if let (ApiErrorKind::RateLimited { .. }, Some(rate_limit)) = (error.kind(), &self.rate_limit) {
            return (retries_so_far < rate_limit.max_retries)
                .then(|| rate_limit.delay(retries_so_far, error.rate_limit_info()));
        }

        (error.is_retryable() && retries_so_far < self.max_retries)
            .then(|| self.backoff.delay(retries_so_far))
    }
}
