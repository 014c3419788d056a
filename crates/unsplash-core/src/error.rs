use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

use crate::context::{ErrorContext, RequestScope};
use crate::http_client::HttpMethod;
use crate::rate_limit::RateLimitInfo;

/// Closed set of failure kinds a caller can branch on.
///
/// Retryability is a property of the kind, computed in [`ApiError::is_retryable`];
/// the only kinds that carry a flag (`Http`, `Network`) have it set by the
/// classifier from the status code or the transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Non-2xx response not covered by a more specific kind.
    Http {
        status: u16,
        response_body: Option<String>,
        retryable: bool,
    },
    /// 401.
    Authentication,
    /// 404, with the resource inferred from the URL path.
    NotFound {
        resource_id: Option<String>,
        resource_type: Option<String>,
    },
    /// 429.
    RateLimited {
        limit: Option<i64>,
        remaining: Option<i64>,
        reset: Option<OffsetDateTime>,
    },
    /// DNS, connect, reset and other transport failures.
    Network { retryable: bool },
    /// The per-attempt timeout elapsed.
    Timeout { timeout: Duration },
    /// The body could not be read as the expected type.
    Parsing {
        raw_content: Option<String>,
        expected_type: Option<String>,
    },
    /// The circuit breaker rejected the call without touching the network.
    CircuitOpen { retry_after: Duration },
}

impl ApiErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Authentication => "authentication",
            Self::NotFound { .. } => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::Parsing { .. } => "parsing",
            Self::CircuitOpen { .. } => "circuit_open",
        }
    }
}

/// Typed failure of a remote call, carrying the request identity and its context.
///
/// Instances are only produced by the classifier in [`crate::classify`], so the
/// kind, the status code and the retry flag always agree.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ApiError {
    kind: ApiErrorKind,
    message: String,
    request_url: Option<String>,
    http_method: Option<HttpMethod>,
    context: Box<ErrorContext>,
}

impl ApiError {
    pub(crate) fn new(
        kind: ApiErrorKind,
        message: impl Into<String>,
        scope: &RequestScope,
        context: ErrorContext,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            request_url: Some(scope.url.clone()),
            http_method: Some(scope.method),
            context: Box::new(context),
        }
    }

    pub fn kind(&self) -> &ApiErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn request_url(&self) -> Option<&str> {
        self.request_url.as_deref()
    }

    pub fn http_method(&self) -> Option<HttpMethod> {
        self.http_method
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn correlation_id(&self) -> &str {
        self.context.correlation_id()
    }

    /// HTTP status behind this error, when it came from a response.
    pub const fn status_code(&self) -> Option<u16> {
        match &self.kind {
            ApiErrorKind::Http { status, .. } => Some(*status),
            ApiErrorKind::Authentication => Some(401),
            ApiErrorKind::NotFound { .. } => Some(404),
            ApiErrorKind::RateLimited { .. } => Some(429),
            ApiErrorKind::Network { .. }
            | ApiErrorKind::Timeout { .. }
            | ApiErrorKind::Parsing { .. }
            | ApiErrorKind::CircuitOpen { .. } => None,
        }
    }

    pub const fn is_retryable(&self) -> bool {
        match &self.kind {
            ApiErrorKind::Http { retryable, .. } | ApiErrorKind::Network { retryable } => {
                *retryable
            }
            ApiErrorKind::Timeout { .. } => true,
            ApiErrorKind::Authentication
            | ApiErrorKind::NotFound { .. }
            | ApiErrorKind::RateLimited { .. }
            | ApiErrorKind::Parsing { .. }
            | ApiErrorKind::CircuitOpen { .. } => false,
        }
    }

    /// Rate-limit snapshot from the failing response, if it carried one.
    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        self.context.rate_limit_info()
    }

    pub(crate) fn map_context(mut self, update: impl FnOnce(ErrorContext) -> ErrorContext) -> Self {
        let context = std::mem::replace(&mut *self.context, ErrorContext::new(None, None));
        *self.context = update(context);
        self
    }
}

/// Marker for a call abandoned because the caller's cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request cancelled by caller")]
pub struct Cancelled;

/// Outcome error of the throwing calling convention.
///
/// Caller cancellation is kept apart from service failures so it is never
/// mistaken for a network or timeout problem.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl RequestError {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Cancelled(_) => None,
            Self::Api(error) => Some(error),
        }
    }

    pub fn into_api_error(self) -> Option<ApiError> {
        match self {
            Self::Cancelled(_) => None,
            Self::Api(error) => Some(error),
        }
    }
}

/// Invalid or missing client configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {name} is required")]
    MissingVariable { name: &'static str },
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidVariable { name: &'static str, value: String },
    #[error("application id cannot be empty")]
    EmptyApplicationId,
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("circuit breaker failure ratio must be in (0, 1], got {value}")]
    InvalidFailureRatio { value: String },
    #[error("circuit breaker minimum throughput must be at least 1")]
    InvalidMinimumThroughput,
    #[error("invalid base url '{value}'")]
    InvalidBaseUrl { value: String },
}
