//! # Unsplash Core
//!
//! Resilient request pipeline and error taxonomy for the Unsplash REST client.
//!
//! ## Overview
//!
//! This crate sits between the endpoint layer (URL building, JSON-to-model
//! mapping) and the network:
//!
//! - **Request executor** running authenticated GETs in two calling conventions
//! - **Resilience pipeline** composing circuit breaker, retry and per-attempt timeout
//! - **Closed error taxonomy** that callers branch on without string matching
//! - **Error context** with correlation id, headers and rate-limit snapshot
//! - **Rate-limit parsing** of the `X-Ratelimit-*` headers
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`circuit_breaker`] | Rolling-window failure-ratio circuit breaker |
//! | [`classify`] | Translation of responses and transport failures into error kinds |
//! | [`config`] | Client and resilience configuration |
//! | [`context`] | Correlation ids and forensic error context |
//! | [`error`] | Error taxonomy |
//! | [`executor`] | Request executor |
//! | [`http_client`] | HTTP client abstraction |
//! | [`pipeline`] | Policy composition |
//! | [`rate_limit`] | Rate-limit header parsing and advisory counters |
//! | [`retry`] | Retry eligibility and backoff schedules |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use unsplash_core::{ClientConfig, RequestExecutor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = RequestExecutor::new(ClientConfig::new("your-access-key"))?;
//!
//!     let body = executor
//!         .execute_raw("https://api.unsplash.com/photos/random", &CancellationToken::new())
//!         .await?;
//!     println!("{body}");
//!     println!("remaining quota: {}", executor.rate_limit_remaining());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Endpoint layer  │
//! └────────┬────────┘
//!          │ execute / execute_raw
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ RequestExecutor │────▶│ Rate-limit       │
//! └────────┬────────┘     │ counters         │
//!          │              └──────────────────┘
//!          ▼
//! ┌─────────────────┐
//! │ Circuit Breaker │  (optional)
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │ Retry + Backoff │
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Attempt Timeout │────▶│ HTTP Client      │
//! └─────────────────┘     │ (reqwest)        │
//!                         └──────────────────┘
//! ```
//!
//! A logical call takes at most `attempt_timeout × (1 + max_retries)` plus the
//! backoff delays; see [`ResilienceConfig::worst_case_duration`].
//!
//! ## Error Handling
//!
//! The throwing convention returns a [`RequestError`]; anything other than caller
//! cancellation is an [`ApiError`] whose kind carries the structured detail:
//!
//! ```rust
//! use unsplash_core::{ApiErrorKind, RequestError};
//!
//! fn handle_error(error: RequestError) {
//!     let RequestError::Api(error) = error else {
//!         // The caller cancelled; nothing to report
//!         return;
//!     };
//!     match error.kind() {
//!         ApiErrorKind::NotFound { resource_id, .. } => {
//!             eprintln!("missing {resource_id:?}");
//!         }
//!         ApiErrorKind::RateLimited { reset, .. } => {
//!             eprintln!("quota resets at {reset:?}");
//!         }
//!         _ if error.is_retryable() => {
//!             // Transient; retry budget already spent
//!         }
//!         _ => {}
//!     }
//! }
//! ```

pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;

// Re-export commonly used types at crate root for convenience

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState};

// Classification
pub use classify::{
    classify_parsing_failure, classify_response, classify_transport_failure, extract_resource,
    TransportFailure,
};

// Configuration
pub use config::{ClientConfig, ResilienceConfig};

// Error context
pub use context::{ErrorContext, PropertyType, PropertyValue, RequestScope};

// Error types
pub use error::{ApiError, ApiErrorKind, Cancelled, ConfigError, RequestError};

// Executor
pub use executor::RequestExecutor;

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
};

// Pipeline
pub use pipeline::{PipelineOutcome, ResiliencePipeline};

// Rate limits
pub use rate_limit::{RateLimitCounters, RateLimitInfo};

// Retry logic
pub use retry::{Backoff, RateLimitRetry, RetryPolicy};

// Cancellation token accepted by every call
pub use tokio_util::sync::CancellationToken;
