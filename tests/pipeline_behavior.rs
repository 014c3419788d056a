//! Behavior-driven tests for the resilience pipeline
//!
//! These tests verify HOW a logical call behaves under transient failures,
//! caller cancellation, slow upstreams and an open circuit, as seen through
//! the request executor.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use unsplash_core::{
    classify_response, ApiErrorKind, CancellationToken, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, ClientConfig, HttpError, HttpRequest, HttpResponse, PipelineOutcome,
    RateLimitRetry, RequestError, RequestExecutor, RequestScope, ResilienceConfig,
    ResiliencePipeline, RetryPolicy,
};
use unsplash_core_tests::{init_tracing, EventLog, ScriptedUpstream, PHOTOS};

fn executor(resilience: ResilienceConfig, upstream: Arc<ScriptedUpstream>) -> RequestExecutor {
    RequestExecutor::new(ClientConfig::new("demo-app").with_resilience(resilience))
        .expect("valid configuration")
        .with_http_client(upstream)
}

// =============================================================================
// Retry: Budget and Recovery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_upstream_always_returns_503_exactly_four_attempts_are_made() {
    init_tracing();

    // Given: A pipeline allowing 3 retries and an upstream that never recovers
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(503, "Service Unavailable"))]);
    let executor = executor(ResilienceConfig::default(), upstream.clone());

    // When: The caller requests photos
    let error = executor
        .execute_raw(PHOTOS, &CancellationToken::new())
        .await
        .expect_err("must fail")
        .into_api_error()
        .expect("api error");

    // Then: 1 initial attempt + 3 retries, and the final error records them
    assert_eq!(upstream.request_count(), 4);
    assert_eq!(error.status_code(), Some(503));
    assert_eq!(error.context().retry_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn when_upstream_recovers_intermediate_failures_never_surface() {
    // Given: Two transient failures followed by success
    let upstream = ScriptedUpstream::new(vec![
        Ok(HttpResponse::new(502, "")),
        Err(HttpError::new("connection reset")),
        Ok(HttpResponse::ok_json("[]")),
    ]);
    let executor = executor(ResilienceConfig::default(), upstream.clone());

    // When: The caller requests photos
    let body = executor
        .execute_raw(PHOTOS, &CancellationToken::new())
        .await
        .expect("recovers");

    // Then: The caller sees only the final body
    assert_eq!(body, "[]");
    assert_eq!(upstream.request_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn when_retrying_backoff_grows_exponentially() {
    // Given: A 1s base delay without jitter and 3 retries
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(500, ""))]);
    let resilience = ResilienceConfig {
        jitter: false,
        ..ResilienceConfig::default()
    };
    let executor = executor(resilience, upstream);
    let started = tokio::time::Instant::now();

    // When: Every attempt fails
    let _ = executor.execute_raw(PHOTOS, &CancellationToken::new()).await;

    // Then: The call waited 1s + 2s + 4s between attempts
    assert_eq!(started.elapsed(), Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn when_error_is_not_retryable_it_surfaces_after_one_attempt() {
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(403, ""))]);
    let executor = executor(ResilienceConfig::default(), upstream.clone());

    let error = executor
        .execute_raw(PHOTOS, &CancellationToken::new())
        .await
        .expect_err("forbidden")
        .into_api_error()
        .expect("api error");

    assert_eq!(upstream.request_count(), 1);
    assert_eq!(error.context().retry_attempts(), 0);
}

// =============================================================================
// Correlation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_call_is_retried_final_error_keeps_callers_correlation_id() {
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(504, ""))]);
    let executor = executor(ResilienceConfig::default(), upstream);

    let error = executor
        .execute_raw_with_correlation_id(PHOTOS, Some("a1b2c3d4"), &CancellationToken::new())
        .await
        .expect_err("must fail")
        .into_api_error()
        .expect("api error");

    assert_eq!(error.correlation_id(), "a1b2c3d4");
    assert!(error.context().summary().starts_with("[a1b2c3d4] "));
}

#[tokio::test(start_paused = true)]
async fn when_no_correlation_id_is_supplied_every_retry_log_shares_the_generated_one() {
    // Given: A failing upstream and a subscriber recording every event
    let log = EventLog::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(503, ""))]);
    let executor = executor(ResilienceConfig::default(), upstream);

    // When: The caller supplies no correlation id
    let error = executor
        .execute_raw(PHOTOS, &CancellationToken::new())
        .await
        .expect_err("must fail")
        .into_api_error()
        .expect("api error");

    // Then: Each retry was logged under the id the final error carries
    let retries = log.with_message("Retrying request");
    assert_eq!(retries.len(), 3);
    assert!(!error.correlation_id().is_empty());
    for event in retries {
        assert_eq!(event.correlation_id.as_deref(), Some(error.correlation_id()));
    }
}

#[tokio::test(start_paused = true)]
async fn when_calls_run_concurrently_each_gets_its_own_correlation_id() {
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(404, ""))]);
    let executor = executor(ResilienceConfig::default(), upstream);
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        executor.execute_raw("https://api.unsplash.com/photos/a", &cancel),
        executor.execute_raw("https://api.unsplash.com/photos/b", &cancel),
    );

    let first = first.expect_err("404").into_api_error().expect("api error");
    let second = second.expect_err("404").into_api_error().expect("api error");
    assert_ne!(first.correlation_id(), second.correlation_id());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_token_fired_before_call_no_attempt_is_made() {
    // Given: An already-cancelled token
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::ok_json("{}"))]);
    let executor = executor(ResilienceConfig::default(), upstream.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    // When: The caller requests photos
    let error = executor
        .execute_raw(PHOTOS, &cancel)
        .await
        .expect_err("cancelled");

    // Then: Cancellation is raised with zero attempts
    assert!(error.is_cancelled());
    assert_eq!(upstream.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn when_token_fires_during_backoff_no_further_attempt_starts() {
    // Given: A failing upstream and a caller that gives up after 500ms
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(503, ""))]);
    let executor = executor(ResilienceConfig::default(), upstream.clone());
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    // When: The first backoff is still running
    let result = executor.execute(PHOTOS, &cancel).await;

    // Then: The non-throwing convention still reports the cancellation
    assert!(result.is_err());
    assert_eq!(upstream.request_count(), 1);
}

// =============================================================================
// Timeout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_upstream_is_too_slow_each_attempt_times_out() {
    // Given: A 1s attempt timeout, 1 retry, and an upstream taking a minute
    let upstream = ScriptedUpstream::slow(Duration::from_secs(60), HttpResponse::ok_json("{}"));
    let resilience = ResilienceConfig {
        max_retries: 1,
        attempt_timeout: Duration::from_secs(1),
        ..ResilienceConfig::default()
    };
    let executor = executor(resilience, upstream.clone());

    // When: The caller requests photos
    let error = executor
        .execute_raw(PHOTOS, &CancellationToken::new())
        .await
        .expect_err("timed out")
        .into_api_error()
        .expect("api error");

    // Then: Both attempts timed out and the error names the timeout
    assert_eq!(upstream.request_count(), 2);
    assert_eq!(
        error.kind(),
        &ApiErrorKind::Timeout {
            timeout: Duration::from_secs(1)
        }
    );
    assert_eq!(error.context().retry_attempts(), 1);
}

// =============================================================================
// Rate-Limit Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_rate_limit_retry_is_disabled_429_surfaces_immediately() {
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(429, ""))]);
    let executor = executor(ResilienceConfig::default(), upstream.clone());

    let error = executor
        .execute_raw(PHOTOS, &CancellationToken::new())
        .await
        .expect_err("rate limited")
        .into_api_error()
        .expect("api error");

    assert!(matches!(error.kind(), ApiErrorKind::RateLimited { .. }));
    assert_eq!(upstream.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn when_rate_limit_retry_is_enabled_429_waits_for_fallback_delay() {
    // Given: The dedicated rate-limit strategy and a 429 without reset header
    let upstream = ScriptedUpstream::new(vec![
        Ok(HttpResponse::new(429, "").with_header("X-Ratelimit-Remaining", "0")),
        Ok(HttpResponse::ok_json("{}")),
    ]);
    let resilience = ResilienceConfig::default().with_rate_limit_retry(RateLimitRetry::default());
    let executor = executor(resilience, upstream.clone());
    let started = tokio::time::Instant::now();

    // When: The caller requests photos
    let body = executor
        .execute_raw(PHOTOS, &CancellationToken::new())
        .await
        .expect("second attempt succeeds");

    // Then: The retry waited the 60s fallback
    assert_eq!(body, "{}");
    assert_eq!(upstream.request_count(), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(60));
}

// =============================================================================
// Circuit Breaker
// =============================================================================

fn breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_ratio: 0.5,
        sampling_duration: Duration::from_secs(30),
        minimum_throughput: 3,
        break_duration: Duration::from_secs(60),
    }
}

#[tokio::test(start_paused = true)]
async fn when_breaker_opens_next_call_fails_without_network_attempt() {
    init_tracing();

    // Given: A breaker-enabled executor without retries and a failing upstream
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(500, ""))]);
    let resilience = ResilienceConfig {
        max_retries: 0,
        ..ResilienceConfig::default()
    }
    .with_circuit_breaker(breaker_config());
    let executor = executor(resilience, upstream.clone());
    let cancel = CancellationToken::new();

    // When: Enough failures accumulate to trip the breaker
    for _ in 0..3 {
        let _ = executor.execute_raw(PHOTOS, &cancel).await;
    }
    assert_eq!(executor.circuit_state(), Some(CircuitState::Open));

    let error = executor
        .execute_raw(PHOTOS, &cancel)
        .await
        .expect_err("circuit open")
        .into_api_error()
        .expect("api error");

    // Then: The call was rejected locally
    assert_eq!(upstream.request_count(), 3);
    assert!(matches!(error.kind(), ApiErrorKind::CircuitOpen { .. }));
}

#[tokio::test(start_paused = true)]
async fn when_break_elapses_exactly_one_trial_is_let_through() {
    // Given: An open breaker shared by a pipeline
    let breaker = Arc::new(CircuitBreaker::new(breaker_config()));
    for _ in 0..3 {
        breaker.try_acquire().expect("closed").record_failure();
    }
    let pipeline = ResiliencePipeline::from_parts(
        RetryPolicy::no_retry(),
        Duration::from_secs(30),
        Some(breaker.clone()),
    );
    let cancel = CancellationToken::new();
    let trial_scope = RequestScope::get(PHOTOS, None, None);
    let second_scope = RequestScope::get(PHOTOS, None, None);

    // When: The break elapses and two calls arrive together
    tokio::time::advance(Duration::from_secs(60)).await;
    let (trial, second): (PipelineOutcome<&str>, PipelineOutcome<&str>) = tokio::join!(
        pipeline.execute(&trial_scope, &cancel, |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok("trial")
        }),
        pipeline.execute(&second_scope, &cancel, |_| async { Ok("second") }),
    );

    // Then: Only the trial reached the upstream, and its success closed the breaker
    assert_eq!(trial.result.expect("trial succeeds"), "trial");
    assert_eq!(second.attempts, 0);
    let rejected = second.result.expect_err("rejected").into_api_error().expect("api error");
    assert!(matches!(rejected.kind(), ApiErrorKind::CircuitOpen { .. }));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn when_trial_fails_breaker_reopens() {
    let upstream = ScriptedUpstream::new(vec![Ok(HttpResponse::new(503, ""))]);
    let resilience = ResilienceConfig {
        max_retries: 0,
        ..ResilienceConfig::default()
    }
    .with_circuit_breaker(breaker_config());
    let executor = executor(resilience, upstream.clone());
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let _ = executor.execute_raw(PHOTOS, &cancel).await;
    }
    tokio::time::advance(Duration::from_secs(60)).await;
    let _ = executor.execute_raw(PHOTOS, &cancel).await;

    assert_eq!(upstream.request_count(), 4);
    assert_eq!(executor.circuit_state(), Some(CircuitState::Open));
}

fn unavailable(scope: &RequestScope) -> RequestError {
    classify_response(scope, &HttpRequest::get(&scope.url), &HttpResponse::new(503, "")).into()
}

#[tokio::test(start_paused = true)]
async fn when_executors_share_a_pipeline_they_share_its_breaker() {
    // Given: Two executors for different upstreams running through one pipeline
    let resilience = ResilienceConfig {
        max_retries: 0,
        ..ResilienceConfig::default()
    }
    .with_circuit_breaker(breaker_config());
    let pipeline = ResiliencePipeline::new(&resilience);
    let failing = ScriptedUpstream::new(vec![Ok(HttpResponse::new(503, ""))]);
    let healthy = ScriptedUpstream::new(vec![Ok(HttpResponse::ok_json("{}"))]);
    let first = executor(resilience.clone(), failing.clone()).with_pipeline(pipeline.clone());
    let second = executor(resilience, healthy.clone()).with_pipeline(pipeline);
    let cancel = CancellationToken::new();

    // When: Failures through the first executor trip the breaker
    for _ in 0..3 {
        let _ = first.execute_raw(PHOTOS, &cancel).await;
    }
    let error = second
        .execute_raw(PHOTOS, &cancel)
        .await
        .expect_err("circuit open")
        .into_api_error()
        .expect("api error");

    // Then: The second executor is rejected without reaching its upstream
    assert!(matches!(error.kind(), ApiErrorKind::CircuitOpen { .. }));
    assert_eq!(second.circuit_state(), Some(CircuitState::Open));
    assert_eq!(failing.request_count(), 3);
    assert_eq!(healthy.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn when_trial_caller_abandons_the_call_breaker_still_recovers() {
    // Given: An open breaker shared with an executor whose upstream is slow but healthy
    let resilience = ResilienceConfig {
        max_retries: 0,
        ..ResilienceConfig::default()
    }
    .with_circuit_breaker(breaker_config());
    let pipeline = ResiliencePipeline::new(&resilience);
    let failing = ScriptedUpstream::new(vec![Ok(HttpResponse::new(503, ""))]);
    let slow = ScriptedUpstream::slow(Duration::from_secs(1), HttpResponse::ok_json("{}"));
    let tripping = executor(resilience.clone(), failing).with_pipeline(pipeline.clone());
    let executor = executor(resilience, slow.clone()).with_pipeline(pipeline);
    let cancel = CancellationToken::new();
    for _ in 0..3 {
        let _ = tripping.execute_raw(PHOTOS, &cancel).await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    // When: The trial call is dropped by an outer timeout before it completes
    let abandoned =
        tokio::time::timeout(Duration::from_millis(10), executor.execute_raw(PHOTOS, &cancel)).await;
    assert!(abandoned.is_err());
    tokio::time::advance(Duration::from_secs(3600)).await;

    // Then: The next call becomes the trial and its success closes the breaker
    let body = executor
        .execute_raw(PHOTOS, &cancel)
        .await
        .expect("healthy trial succeeds");
    assert_eq!(body, "{}");
    assert_eq!(slow.request_count(), 2);
    assert_eq!(executor.circuit_state(), Some(CircuitState::Closed));
}

#[tokio::test(start_paused = true)]
async fn when_call_admitted_before_trip_finishes_late_the_trial_still_decides() {
    // Given: A slow call admitted while the breaker was closed
    let pipeline = ResiliencePipeline::from_parts(
        RetryPolicy::no_retry(),
        Duration::from_secs(120),
        Some(Arc::new(CircuitBreaker::new(breaker_config()))),
    );
    let cancel = CancellationToken::new();
    let slow_scope = RequestScope::get(PHOTOS, None, None);
    let scope = RequestScope::get(PHOTOS, None, None);

    let slow_call = pipeline.execute(&slow_scope, &cancel, |_| async {
        tokio::time::sleep(Duration::from_secs(90)).await;
        Ok("slow")
    });

    // When: Other calls trip the breaker and a slow trial is admitted after the break
    let trip_then_trial = async {
        for _ in 0..3 {
            let _: PipelineOutcome<()> = pipeline
                .execute(&scope, &cancel, |_| {
                    let error = unavailable(&scope);
                    async move { Err(error) }
                })
                .await;
        }
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Open));
        tokio::time::sleep(Duration::from_secs(60)).await;

        let trial: PipelineOutcome<()> = pipeline
            .execute(&scope, &cancel, |_| {
                let error = unavailable(&scope);
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(error)
                }
            })
            .await;
        trial
    };
    let state_after_slow_call = async {
        tokio::time::sleep(Duration::from_secs(95)).await;
        pipeline.circuit_state()
    };
    let (slow, trial, observed) = tokio::join!(slow_call, trip_then_trial, state_after_slow_call);

    // Then: The early success left the breaker half-open and the trial's failure reopened it
    assert_eq!(slow.result.expect("slow call succeeds"), "slow");
    assert_eq!(observed, Some(CircuitState::HalfOpen));
    assert!(trial.result.is_err());
    assert_eq!(pipeline.circuit_state(), Some(CircuitState::Open));
}
