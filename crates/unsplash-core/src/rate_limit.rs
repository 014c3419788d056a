//! Rate-limit snapshots parsed from response headers, plus the client-level
//! advisory counters fed by successful responses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use time::{Duration, OffsetDateTime};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Immutable quota snapshot taken from one HTTP response.
///
/// At least one of the three fields is always present; a response without any
/// usable rate-limit header yields no snapshot at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    limit: Option<i64>,
    remaining: Option<i64>,
    #[serde(with = "time::serde::timestamp::option")]
    reset: Option<OffsetDateTime>,
}

impl RateLimitInfo {
    pub fn new(
        limit: Option<i64>,
        remaining: Option<i64>,
        reset: Option<OffsetDateTime>,
    ) -> Option<Self> {
        if limit.is_none() && remaining.is_none() && reset.is_none() {
            return None;
        }

        Some(Self {
            limit,
            remaining,
            reset,
        })
    }

    /// Reads `X-Ratelimit-Limit`, `X-Ratelimit-Remaining` and `X-Ratelimit-Reset`
    /// (Unix seconds). Header names match case-insensitively and values that do not
    /// parse are treated as missing.
    pub fn parse(headers: &BTreeMap<String, String>) -> Option<Self> {
        let limit = header_value(headers, LIMIT_HEADER).and_then(parse_integer);
        let remaining = header_value(headers, REMAINING_HEADER).and_then(parse_integer);
        let reset = header_value(headers, RESET_HEADER)
            .and_then(parse_integer)
            .and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok());

        Self::new(limit, remaining, reset)
    }

    pub const fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub const fn remaining(&self) -> Option<i64> {
        self.remaining
    }

    pub const fn reset(&self) -> Option<OffsetDateTime> {
        self.reset
    }

    pub fn is_exceeded(&self) -> bool {
        matches!(self.remaining, Some(remaining) if remaining <= 0)
    }

    /// Signed time left until the quota window resets; negative once the reset
    /// instant has passed.
    pub fn time_until_reset(&self) -> Option<Duration> {
        self.time_until_reset_at(OffsetDateTime::now_utc())
    }

    pub fn time_until_reset_at(&self, now: OffsetDateTime) -> Option<Duration> {
        self.reset.map(|reset| reset - now)
    }
}

/// Case-insensitive header lookup returning the first value.
pub fn header_value<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.split(',').next().unwrap_or(value).trim())
}

fn parse_integer(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

/// Advisory quota counters taken from the last successful response.
///
/// Updates are last-write-wins. Under concurrent calls a reader may see a limit
/// and a remaining count that came from different responses; nothing gates request
/// admission on these values.
#[derive(Debug, Default)]
pub struct RateLimitCounters {
    max_rate_limit: AtomicI64,
    remaining: AtomicI64,
}

impl RateLimitCounters {
    pub fn record(&self, info: &RateLimitInfo) {
        if let Some(limit) = info.limit() {
            self.max_rate_limit.store(limit, Ordering::Relaxed);
        }
        if let Some(remaining) = info.remaining() {
            self.remaining.store(remaining, Ordering::Relaxed);
        }
    }

    pub fn max_rate_limit(&self) -> i64 {
        self.max_rate_limit.load(Ordering::Relaxed)
    }

    pub fn rate_limit_remaining(&self) -> i64 {
        self.remaining.load(Ordering::Relaxed)
    }
}
