//! Entry point used by the endpoint layer: one authenticated GET through the
//! resilience pipeline, in both calling conventions.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitState;
use crate::classify::{
    classify_parsing_failure, classify_response, classify_transport_failure, classify_unexpected,
    TransportFailure,
};
use crate::config::ClientConfig;
use crate::context::{new_correlation_id, RequestScope};
use crate::error::{ApiError, Cancelled, ConfigError, RequestError};
use crate::http_client::{HttpAuth, HttpClient, HttpError, HttpRequest, ReqwestHttpClient};
use crate::pipeline::ResiliencePipeline;
use crate::rate_limit::{RateLimitCounters, RateLimitInfo};

/// Executes GET requests against the API with retry, timeout and optional
/// circuit breaking.
///
/// The transport is created on first use and reused for the executor's
/// lifetime. Clones of an executor are not provided; share it behind an `Arc`.
pub struct RequestExecutor {
    config: ClientConfig,
    auth: HttpAuth,
    transport: OnceCell<Arc<dyn HttpClient>>,
    pipeline: ResiliencePipeline,
    rate_limits: RateLimitCounters,
}

impl Debug for RequestExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("config", &self.config)
            .field("transport_ready", &self.transport.initialized())
            .field("pipeline", &self.pipeline)
            .field("rate_limits", &self.rate_limits)
            .finish()
    }
}

impl RequestExecutor {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let pipeline = ResiliencePipeline::new(&config.resilience);
        let auth = HttpAuth::ClientId(config.application_id.clone());

        Ok(Self {
            config,
            auth,
            transport: OnceCell::new(),
            pipeline,
            rate_limits: RateLimitCounters::default(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Replaces the lazily-built reqwest transport.
    pub fn with_http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.transport = OnceCell::new_with(Some(http_client));
        self
    }

    /// Runs calls through an existing pipeline, sharing its breaker state.
    pub fn with_pipeline(mut self, pipeline: ResiliencePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &ResiliencePipeline {
        &self.pipeline
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.pipeline.circuit_state()
    }

    /// `X-Ratelimit-Limit` of the last successful response, or 0 before any.
    pub fn max_rate_limit(&self) -> i64 {
        self.rate_limits.max_rate_limit()
    }

    /// `X-Ratelimit-Remaining` of the last successful response, or 0 before any.
    pub fn rate_limit_remaining(&self) -> i64 {
        self.rate_limits.rate_limit_remaining()
    }

    /// Non-throwing convention: taxonomy failures are logged and collapse to
    /// `None`. Caller cancellation is still reported.
    pub async fn execute(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Cancelled> {
        match self.execute_raw(url, cancel).await {
            Ok(body) => Ok(Some(body)),
            Err(RequestError::Cancelled(cancelled)) => Err(cancelled),
            Err(RequestError::Api(_)) => Ok(None),
        }
    }

    /// Throwing convention: returns the body of a 2xx response or the classified
    /// failure, with retry count and elapsed time in its context.
    pub async fn execute_raw(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RequestError> {
        self.execute_raw_with_correlation_id(url, None, cancel)
            .await
    }

    /// Same as [`RequestExecutor::execute_raw`] with a caller-chosen correlation id.
    pub async fn execute_raw_with_correlation_id(
        &self,
        url: &str,
        correlation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, RequestError> {
        let scope = RequestScope::get(url, Some(&self.config.application_id), correlation_id);
        let started = Instant::now();

        if cancel.is_cancelled() {
            tracing::info!(
                correlation_id = %scope.correlation_id,
                attempts = 0,
                "Request cancelled by caller before it started"
            );
            return Err(Cancelled.into());
        }

        tracing::debug!(
            correlation_id = %scope.correlation_id,
            method = %scope.method,
            url = %scope.url,
            "Starting request"
        );

        let transport = match self.transport().await {
            Ok(transport) => transport,
            Err(error) => {
                let error = classify_unexpected(&error, &scope)
                    .map_context(|context| context.with_elapsed_time(started.elapsed()));
                log_failure(&error);
                return Err(error.into());
            }
        };

        let request = HttpRequest::get(url).with_header("accept", "application/json");
        let request = &request;
        let scope_ref = &scope;

        let outcome = self
            .pipeline
            .execute(scope_ref, cancel, |_attempt| async move {
                match transport.execute(request.clone()).await {
                    Ok(response) if response.is_success() => Ok(response),
                    Ok(response) => Err(classify_response(scope_ref, request, &response).into()),
                    Err(error) => Err(classify_transport_failure(
                        TransportFailure::Http(error),
                        scope_ref,
                    )),
                }
            })
            .await;

        let attempts = outcome.attempts;
        let retries = outcome.retries();
        let elapsed = started.elapsed();

        match outcome.result {
            Ok(response) => {
                if let Some(info) = RateLimitInfo::parse(&response.headers) {
                    self.rate_limits.record(&info);
                }
                tracing::debug!(
                    correlation_id = %scope.correlation_id,
                    status = response.status,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request succeeded"
                );
                Ok(response.body)
            }
            Err(RequestError::Cancelled(cancelled)) => {
                tracing::info!(
                    correlation_id = %scope.correlation_id,
                    attempts,
                    "Request cancelled by caller"
                );
                Err(cancelled.into())
            }
            Err(RequestError::Api(error)) => {
                let error = error.map_context(|context| {
                    context
                        .with_retry_attempts(retries)
                        .with_elapsed_time(elapsed)
                });
                log_failure(&error);
                Err(error.into())
            }
        }
    }

    /// Fetches `url` and decodes the body as `T`. A body that does not decode
    /// becomes a parsing error naming `expected_type`.
    pub async fn execute_json<T>(
        &self,
        url: &str,
        expected_type: &str,
        cancel: &CancellationToken,
    ) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
    {
        let correlation_id = new_correlation_id();
        let body = self
            .execute_raw_with_correlation_id(url, Some(&correlation_id), cancel)
            .await?;

        serde_json::from_str(&body).map_err(|error| {
            let scope = RequestScope::get(
                url,
                Some(&self.config.application_id),
                Some(&correlation_id),
            );
            let error = classify_parsing_failure(&error, &body, expected_type, &scope);
            log_failure(&error);
            RequestError::Api(error)
        })
    }

    async fn transport(&self) -> Result<&Arc<dyn HttpClient>, HttpError> {
        self.transport
            .get_or_try_init(|| async {
                let client = ReqwestHttpClient::new(&self.auth, &self.config.user_agent)?;
                Ok(Arc::new(client) as Arc<dyn HttpClient>)
            })
            .await
    }
}

fn log_failure(error: &ApiError) {
    tracing::error!(
        correlation_id = %error.correlation_id(),
        kind = error.kind().as_str(),
        status = ?error.status_code(),
        retryable = error.is_retryable(),
        context = %error.context().summary(),
        error = %error,
        "Request failed"
    );
}
