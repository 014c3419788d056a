//! Correlation-scoped forensic context attached to every failed call.

use std::collections::BTreeMap;
use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::http_client::{HttpMethod, HttpRequest, HttpResponse};
use crate::rate_limit::RateLimitInfo;

const REDACTED: &str = "<redacted>";

/// Generates a short opaque correlation id (8 hex characters).
pub fn new_correlation_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Identity of one logical call: the target, the caller's application, and the
/// correlation id shared by every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub url: String,
    pub method: HttpMethod,
    pub application_id: Option<String>,
    pub correlation_id: String,
}

impl RequestScope {
    pub fn get(
        url: impl Into<String>,
        application_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            application_id: application_id.map(str::to_string),
            correlation_id: correlation_id
                .map(str::to_string)
                .unwrap_or_else(new_correlation_id),
        }
    }

    /// Fresh context bound to this scope's application and correlation id.
    pub fn context(&self) -> ErrorContext {
        ErrorContext::new(
            self.application_id.as_deref(),
            Some(self.correlation_id.as_str()),
        )
    }
}

/// Typed value stored in [`ErrorContext`] properties.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
    Duration(Duration),
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<Duration> for PropertyValue {
    fn from(value: Duration) -> Self {
        Self::Duration(value)
    }
}

/// Types that can be read back out of a [`PropertyValue`].
pub trait PropertyType: Sized {
    fn from_property(value: &PropertyValue) -> Option<Self>;
}

impl PropertyType for String {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Text(text) => Some(text.clone()),
            _ => None,
        }
    }
}

impl PropertyType for i64 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Integer(number) => Some(*number),
            _ => None,
        }
    }
}

impl PropertyType for f64 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Float(number) => Some(*number),
            _ => None,
        }
    }
}

impl PropertyType for bool {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Flag(flag) => Some(*flag),
            _ => None,
        }
    }
}

impl PropertyType for Duration {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Duration(duration) => Some(*duration),
            _ => None,
        }
    }
}

/// Forensic bundle for one logical operation, including all of its retries.
///
/// A context belongs to exactly one call. The `with_*` builders consume and
/// return it, so an enriched context is never observed by another attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext {
    timestamp: OffsetDateTime,
    application_id: Option<String>,
    correlation_id: String,
    request_headers: BTreeMap<String, String>,
    response_headers: BTreeMap<String, String>,
    rate_limit_info: Option<RateLimitInfo>,
    retry_attempts: u32,
    elapsed_time: Option<Duration>,
    properties: BTreeMap<String, PropertyValue>,
}

impl ErrorContext {
    /// Creates a context, generating a correlation id when none is supplied.
    pub fn new(application_id: Option<&str>, correlation_id: Option<&str>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            application_id: application_id.map(str::to_string),
            correlation_id: correlation_id
                .map(str::to_string)
                .unwrap_or_else(new_correlation_id),
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            rate_limit_info: None,
            retry_attempts: 0,
            elapsed_time: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn from_request(
        request: &HttpRequest,
        application_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Self {
        let mut context = Self::new(application_id, correlation_id);
        context.request_headers = redact_headers(&request.headers);
        context
    }

    /// Captures request and response headers plus the response's rate-limit snapshot.
    pub fn from_response(
        request: &HttpRequest,
        response: &HttpResponse,
        application_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Self {
        let mut context = Self::from_request(request, application_id, correlation_id);
        context.response_headers = redact_headers(&response.headers);
        context.rate_limit_info = RateLimitInfo::parse(&response.headers);
        context
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_elapsed_time(mut self, elapsed: Duration) -> Self {
        self.elapsed_time = Some(elapsed);
        self
    }

    pub fn with_rate_limit_info(mut self, info: Option<RateLimitInfo>) -> Self {
        self.rate_limit_info = info;
        self
    }

    /// Type-checked property lookup. Absence and type mismatch both yield `None`.
    pub fn get_property<T: PropertyType>(&self, key: &str) -> Option<T> {
        self.properties.get(key).and_then(T::from_property)
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn request_headers(&self) -> &BTreeMap<String, String> {
        &self.request_headers
    }

    pub fn response_headers(&self) -> &BTreeMap<String, String> {
        &self.response_headers
    }

    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        self.rate_limit_info.as_ref()
    }

    pub const fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub const fn elapsed_time(&self) -> Option<Duration> {
        self.elapsed_time
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// One-line log summary, e.g.
    /// `[1a2b3c4d] 2024-01-02 03:04:05.678 UTC | App: demo | Rate: 0/50 | Retries: 3 | Elapsed: 1520ms`.
    pub fn summary(&self) -> String {
        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );
        let timestamp = self.timestamp.format(&format).unwrap_or_default();
        let mut summary = format!("[{}] {timestamp} UTC", self.correlation_id);

        if let Some(application_id) = self.application_id.as_deref().filter(|id| !id.is_empty()) {
            summary.push_str(&format!(" | App: {application_id}"));
        }

        if let Some(info) = &self.rate_limit_info {
            summary.push_str(&format!(
                " | Rate: {}/{}",
                display_optional(info.remaining()),
                display_optional(info.limit())
            ));
        }

        if self.retry_attempts > 0 {
            summary.push_str(&format!(" | Retries: {}", self.retry_attempts));
        }

        if let Some(elapsed) = self.elapsed_time {
            summary.push_str(&format!(" | Elapsed: {}ms", elapsed.as_millis()));
        }

        summary
    }
}

fn display_optional(value: Option<i64>) -> String {
    value.map_or_else(|| String::from("?"), |value| value.to_string())
}

fn redact_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let lowered = name.to_ascii_lowercase();
            let value = if lowered == "authorization" || lowered == "cookie" {
                String::from(REDACTED)
            } else {
                value.clone()
            };
            (lowered, value)
        })
        .collect()
}
