//! Translation of raw transport and protocol failures into [`ApiError`] kinds.
//!
//! Every function here is total: each input maps to exactly one kind, and none
//! of them can fail. Classification happens once, where the failure is first
//! observed; the resulting error is passed through unchanged afterwards.

use std::fmt::Display;
use std::time::Duration;

use url::Url;

use crate::context::{ErrorContext, RequestScope};
use crate::error::{ApiError, ApiErrorKind, Cancelled, RequestError};
use crate::http_client::{HttpError, HttpRequest, HttpResponse};

/// Status codes that are retryable regardless of their class.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [500, 502, 503, 504, 408];

/// Raw failure of a single attempt, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The transport could not produce a response.
    Http(HttpError),
    /// The pipeline's per-attempt timeout elapsed.
    TimedOut(Duration),
    /// The caller's own cancellation token fired.
    Cancelled,
}

pub fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status) || RETRYABLE_STATUS_CODES.contains(&status)
}

/// Maps a non-2xx response to its error kind, capturing headers and any
/// rate-limit snapshot in the attached context.
pub fn classify_response(
    scope: &RequestScope,
    request: &HttpRequest,
    response: &HttpResponse,
) -> ApiError {
    let context = ErrorContext::from_response(
        request,
        response,
        scope.application_id.as_deref(),
        Some(scope.correlation_id.as_str()),
    );
    let status = response.status;

    match status {
        401 => ApiError::new(
            ApiErrorKind::Authentication,
            "Authentication failed. Please check your application ID or access token.",
            scope,
            context,
        ),
        404 => {
            let (resource_id, resource_type) = extract_resource(&scope.url);
            let message = format!(
                "The requested {} was not found.",
                resource_type.as_deref().unwrap_or("resource")
            );
            ApiError::new(
                ApiErrorKind::NotFound {
                    resource_id,
                    resource_type,
                },
                message,
                scope,
                context,
            )
        }
        429 => {
            let info = context.rate_limit_info().copied();
            ApiError::new(
                ApiErrorKind::RateLimited {
                    limit: info.and_then(|info| info.limit()),
                    remaining: info.and_then(|info| info.remaining()),
                    reset: info.and_then(|info| info.reset()),
                },
                "Rate limit exceeded. Please wait before making more requests.",
                scope,
                context,
            )
        }
        _ => {
            let retryable = is_retryable_status(status);
            let message = match status {
                400 => String::from("Bad request. Please check your request parameters."),
                403 => String::from(
                    "Access forbidden. You may not have permission to access this resource.",
                ),
                _ if retryable => format!(
                    "Server returned status code {status}. This error may be temporary."
                ),
                _ => format!("HTTP request failed with status code {status}."),
            };
            ApiError::new(
                ApiErrorKind::Http {
                    status,
                    response_body: Some(response.body.clone()).filter(|body| !body.is_empty()),
                    retryable,
                },
                message,
                scope,
                context,
            )
        }
    }
}

/// Maps a failed attempt to its outcome. Caller cancellation stays a plain
/// cancellation; the pipeline's own timeout becomes a retryable timeout error.
pub fn classify_transport_failure(failure: TransportFailure, scope: &RequestScope) -> RequestError {
    match failure {
        TransportFailure::Cancelled => RequestError::Cancelled(Cancelled),
        TransportFailure::TimedOut(timeout) => RequestError::Api(ApiError::new(
            ApiErrorKind::Timeout { timeout },
            format!(
                "Request timed out after {}ms. The server may be experiencing high load.",
                timeout.as_millis()
            ),
            scope,
            scope.context(),
        )),
        TransportFailure::Http(error) => RequestError::Api(ApiError::new(
            ApiErrorKind::Network {
                retryable: error.retryable(),
            },
            format!("Network error occurred while making the request: {error}"),
            scope,
            scope.context(),
        )),
    }
}

/// Builds the error for a body that could not be decoded as `expected_type`.
pub fn classify_parsing_failure(
    error: &dyn Display,
    raw_body: &str,
    expected_type: &str,
    scope: &RequestScope,
) -> ApiError {
    ApiError::new(
        ApiErrorKind::Parsing {
            raw_content: Some(raw_body.to_string()),
            expected_type: Some(expected_type.to_string()),
        },
        format!("Failed to parse the API response as {expected_type}: {error}"),
        scope,
        scope.context(),
    )
}

/// Failure that is neither a response nor a transport error, such as being
/// unable to construct the transport itself. Never retried.
pub fn classify_unexpected(error: &dyn Display, scope: &RequestScope) -> ApiError {
    ApiError::new(
        ApiErrorKind::Network { retryable: false },
        format!("An unexpected error occurred while processing the request: {error}"),
        scope,
        scope.context(),
    )
}

pub fn circuit_open(retry_after: Duration, scope: &RequestScope) -> ApiError {
    ApiError::new(
        ApiErrorKind::CircuitOpen { retry_after },
        format!(
            "Circuit breaker is open; calls are rejected for another {}ms.",
            retry_after.as_millis()
        ),
        scope,
        scope.context(),
    )
}

/// Infers `(resource_id, resource_type)` from the last two path segments.
pub fn extract_resource(url: &str) -> (Option<String>, Option<String>) {
    let Ok(parsed) = Url::parse(url) else {
        return (None, None);
    };
    let Some(segments) = parsed.path_segments() else {
        return (None, None);
    };

    let segments: Vec<&str> = segments.filter(|segment| !segment.is_empty()).collect();
    let [.., kind, id] = segments.as_slice() else {
        return (None, None);
    };

    let resource_id = urlencoding::decode(id)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| id.to_string());
    let resource_type = match *kind {
        "photos" => "photo",
        "collections" => "collection",
        "users" => "user",
        other => other,
    };

    (Some(resource_id), Some(resource_type.to_string()))
}
