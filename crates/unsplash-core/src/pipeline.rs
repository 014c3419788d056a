//! Composition of the circuit-breaker, retry and timeout policies around one
//! unit of work.
//!
//! Policies nest outermost to innermost as breaker → retry → timeout: the timeout
//! bounds a single attempt, the retry loop re-runs timed-out or transient
//! attempts, and the breaker sees only the final outcome of the whole retried
//! call. A call that times out on every attempt therefore counts as one failure
//! in the breaker's window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitState};
use crate::classify::{circuit_open, classify_transport_failure, TransportFailure};
use crate::config::ResilienceConfig;
use crate::context::RequestScope;
use crate::error::{ApiError, ApiErrorKind, Cancelled, RequestError};
use crate::retry::RetryPolicy;

/// Final result of a pipeline run and the number of attempts actually started.
#[derive(Debug)]
pub struct PipelineOutcome<T> {
    pub result: Result<T, RequestError>,
    pub attempts: u32,
}

impl<T> PipelineOutcome<T> {
    fn new(result: Result<T, RequestError>, attempts: u32) -> Self {
        Self { result, attempts }
    }

    /// Retries performed after the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Reusable resilience pipeline. Breaker state is shared by every call that
/// runs through the same instance.
#[derive(Debug, Clone)]
pub struct ResiliencePipeline {
    retry: RetryPolicy,
    attempt_timeout: Duration,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl Default for ResiliencePipeline {
    fn default() -> Self {
        Self::new(&ResilienceConfig::default())
    }
}

impl ResiliencePipeline {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            attempt_timeout: config.attempt_timeout,
            circuit_breaker: config
                .circuit_breaker
                .map(|breaker| Arc::new(CircuitBreaker::new(breaker))),
        }
    }

    pub fn from_parts(
        retry: RetryPolicy,
        attempt_timeout: Duration,
        circuit_breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            retry,
            attempt_timeout,
            circuit_breaker,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.circuit_breaker.as_deref().map(CircuitBreaker::state)
    }

    /// Runs `operation` under the pipeline's policies.
    ///
    /// `operation` receives the 0-based attempt number and must classify its own
    /// failures; the pipeline only adds timeout and breaker-open errors. A token
    /// that has already fired yields `Cancelled` without any attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        scope: &RequestScope,
        cancel: &CancellationToken,
        operation: F,
    ) -> PipelineOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        if cancel.is_cancelled() {
            return PipelineOutcome::new(Err(Cancelled.into()), 0);
        }

        // Held across every await below: abandoning this future drops the permit
        // and hands a half-open trial to the next caller.
        let permit = match self.admit(scope) {
            Ok(permit) => permit,
            Err(error) => return PipelineOutcome::new(Err(error.into()), 0),
        };

        let outcome = self.run_with_retry(scope, cancel, operation).await;
        if let (Some(breaker), Some(permit)) = (self.circuit_breaker.as_deref(), permit) {
            record_outcome(breaker, scope, permit, &outcome.result);
        }
        outcome
    }

    fn admit(&self, scope: &RequestScope) -> Result<Option<CircuitPermit<'_>>, ApiError> {
        let Some(breaker) = &self.circuit_breaker else {
            return Ok(None);
        };

        match breaker.try_acquire() {
            Ok(permit) => {
                if permit.is_trial() {
                    tracing::info!(
                        correlation_id = %scope.correlation_id,
                        state = CircuitState::HalfOpen.as_str(),
                        "Circuit breaker half-open; sending trial request"
                    );
                }
                Ok(Some(permit))
            }
            Err(retry_after) => {
                tracing::debug!(
                    correlation_id = %scope.correlation_id,
                    retry_after = ?retry_after,
                    "Circuit breaker open; rejecting request"
                );
                Err(circuit_open(retry_after, scope))
            }
        }
    }

    async fn run_with_retry<T, F, Fut>(
        &self,
        scope: &RequestScope,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> PipelineOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut attempts: u32 = 0;

        loop {
            let attempt = attempts;
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RequestError::Cancelled(Cancelled)),
                timed = tokio::time::timeout(self.attempt_timeout, operation(attempt)) => match timed {
                    Ok(result) => result,
                    Err(_) => Err(classify_transport_failure(
                        TransportFailure::TimedOut(self.attempt_timeout),
                        scope,
                    )),
                },
            };

            let error = match result {
                Ok(value) => return PipelineOutcome::new(Ok(value), attempts),
                Err(RequestError::Cancelled(cancelled)) => {
                    return PipelineOutcome::new(Err(cancelled.into()), attempts);
                }
                Err(RequestError::Api(error)) => error,
            };

            if cancel.is_cancelled() {
                return PipelineOutcome::new(Err(Cancelled.into()), attempts);
            }

            let Some(delay) = self.retry.next_delay(&error, attempt, cancel) else {
                return PipelineOutcome::new(Err(error.into()), attempts);
            };

            tracing::warn!(
                correlation_id = %scope.correlation_id,
                attempt = attempts,
                max_retries = self.retry.max_retries,
                kind = error.kind().as_str(),
                status = ?error.status_code(),
                delay = ?delay,
                error = %error,
                "Retrying request"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return PipelineOutcome::new(Err(Cancelled.into()), attempts);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn record_outcome<T>(
    breaker: &CircuitBreaker,
    scope: &RequestScope,
    permit: CircuitPermit<'_>,
    result: &Result<T, RequestError>,
) {
    let transition = match result {
        Ok(_) => permit.record_success(),
        // Dropping the permit unsettled releases a half-open trial.
        Err(RequestError::Cancelled(_)) => None,
        Err(RequestError::Api(error)) if counts_as_failure(error) => permit.record_failure(),
        Err(RequestError::Api(_)) => permit.record_success(),
    };

    match transition {
        Some(CircuitState::Open) => tracing::warn!(
            correlation_id = %scope.correlation_id,
            break_duration = ?breaker.config().break_duration,
            "Circuit breaker opened; too many failures detected"
        ),
        Some(CircuitState::Closed) => tracing::info!(
            correlation_id = %scope.correlation_id,
            "Circuit breaker closed; service appears healthy again"
        ),
        Some(CircuitState::HalfOpen) | None => {}
    }
}

/// Whether an outcome signals an unhealthy service. Client-side mistakes such as
/// 401 or 404 prove the service answered and count as healthy.
pub fn counts_as_failure(error: &ApiError) -> bool {
    match error.kind() {
        ApiErrorKind::Network { .. }
        | ApiErrorKind::Timeout { .. }
        | ApiErrorKind::RateLimited { .. } => true,
        ApiErrorKind::Http { retryable, .. } => *retryable,
        ApiErrorKind::Authentication
        | ApiErrorKind::NotFound { .. }
        | ApiErrorKind::Parsing { .. }
        | ApiErrorKind::CircuitOpen { .. } => false,
    }
}
