//! Client and pipeline configuration.

use std::env;
use std::time::Duration;

use url::Url;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::retry::{Backoff, RateLimitRetry, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://api.unsplash.com";
pub const DEFAULT_USER_AGENT: &str = concat!("unsplash-core/", env!("CARGO_PKG_VERSION"));

pub const ENV_APPLICATION_ID: &str = "UNSPLASH_APPLICATION_ID";
pub const ENV_BASE_URL: &str = "UNSPLASH_BASE_URL";
pub const ENV_MAX_RETRIES: &str = "UNSPLASH_MAX_RETRIES";
pub const ENV_TIMEOUT_SECS: &str = "UNSPLASH_TIMEOUT_SECS";
pub const ENV_CIRCUIT_BREAKER: &str = "UNSPLASH_CIRCUIT_BREAKER";

/// Tuning for the timeout, retry and circuit-breaker policies.
///
/// Timeouts apply per attempt, so one logical call can take up to
/// `attempt_timeout × (1 + max_retries)` plus the backoff delays between attempts;
/// [`ResilienceConfig::worst_case_duration`] computes the full bound.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap on a single backoff delay, before jitter.
    pub max_delay: Duration,
    pub jitter: bool,
    pub attempt_timeout: Duration,
    /// Opt-in; `None` disables the breaker.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Opt-in; `None` surfaces 429 responses immediately.
    pub rate_limit_retry: Option<RateLimitRetry>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
            attempt_timeout: Duration::from_secs(30),
            circuit_breaker: None,
            rate_limit_retry: None,
        }
    }
}

impl ResilienceConfig {
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_rate_limit_retry(mut self, retry: RateLimitRetry) -> Self {
        self.rate_limit_retry = Some(retry);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff::Exponential {
                base: self.base_delay,
                factor: 2.0,
                max: self.max_delay,
                jitter: self.jitter,
            },
            rate_limit: self.rate_limit_retry,
        }
    }

    /// Upper bound on the wall-clock time of one logical call, including jitter.
    pub fn worst_case_duration(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let mut total = self.attempt_timeout.saturating_mul(attempts);

        let backoff = Backoff::Exponential {
            base: self.base_delay,
            factor: 2.0,
            max: self.max_delay,
            jitter: false,
        };
        for attempt in 0..self.max_retries {
            let delay = backoff.delay(attempt);
            let jitter = if self.jitter { delay / 2 } else { Duration::ZERO };
            total = total.saturating_add(delay).saturating_add(jitter);
        }

        if let Some(rate_limit) = self.rate_limit_retry {
            for attempt in 0..rate_limit.max_retries {
                let delay = rate_limit.delay(attempt, None).max(rate_limit.max_delay);
                total = total
                    .saturating_add(self.attempt_timeout)
                    .saturating_add(delay);
            }
        }

        total
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "attempt_timeout",
            });
        }

        if let Some(breaker) = &self.circuit_breaker {
            if !(breaker.failure_ratio > 0.0 && breaker.failure_ratio <= 1.0) {
                return Err(ConfigError::InvalidFailureRatio {
                    value: breaker.failure_ratio.to_string(),
                });
            }
            if breaker.minimum_throughput == 0 {
                return Err(ConfigError::InvalidMinimumThroughput);
            }
            if breaker.sampling_duration.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    field: "sampling_duration",
                });
            }
            if breaker.break_duration.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    field: "break_duration",
                });
            }
        }

        Ok(())
    }
}

/// Everything needed to build a [`crate::RequestExecutor`].
///
/// The application id is sent as `Authorization: Client-ID …`. `Debug` output
/// redacts it; error summaries name it so failures can be traced per application.
#[derive(Clone, PartialEq)]
pub struct ClientConfig {
    pub application_id: String,
    pub base_url: String,
    pub user_agent: String,
    pub resilience: ResilienceConfig,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("application_id", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("resilience", &self.resilience)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            base_url: String::from(DEFAULT_BASE_URL),
            user_agent: String::from(DEFAULT_USER_AGENT),
            resilience: ResilienceConfig::default(),
        }
    }

    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Joins `path` onto the base URL, e.g. `photos/random` →
    /// `https://api.unsplash.com/photos/random`.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Reads the configuration from `UNSPLASH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let application_id = lookup(ENV_APPLICATION_ID)
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::MissingVariable {
                name: ENV_APPLICATION_ID,
            })?;

        let mut config = Self::new(application_id.trim());

        if let Some(base_url) = lookup(ENV_BASE_URL) {
            config.base_url = base_url.trim().trim_end_matches('/').to_string();
        }

        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            config.resilience.max_retries =
                raw.trim()
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidVariable {
                        name: ENV_MAX_RETRIES,
                        value: raw.clone(),
                    })?;
        }

        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            let seconds = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidVariable {
                    name: ENV_TIMEOUT_SECS,
                    value: raw.clone(),
                })?;
            config.resilience.attempt_timeout = Duration::from_secs(seconds);
        }

        if let Some(raw) = lookup(ENV_CIRCUIT_BREAKER) {
            if parse_flag(&raw).ok_or_else(|| ConfigError::InvalidVariable {
                name: ENV_CIRCUIT_BREAKER,
                value: raw.clone(),
            })? {
                config.resilience.circuit_breaker = Some(CircuitBreakerConfig::default());
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_id.trim().is_empty() {
            return Err(ConfigError::EmptyApplicationId);
        }

        Url::parse(&self.base_url).map_err(|_| ConfigError::InvalidBaseUrl {
            value: self.base_url.clone(),
        })?;

        self.resilience.validate()
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
