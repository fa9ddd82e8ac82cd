//! Integration tests for protected HTTP calls.
//!
//! A wiremock server stands in for the downstream service, so these tests
//! exercise the real reqwest transport together with retry, per-attempt
//! timeouts and the call deadline.

use std::time::Duration;

use bulwark::{
    CircuitState, Config, Error, ResilienceCore, RetryPolicy, ServiceConfig, ServiceRequest,
    ServiceTimeouts,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Test Helpers
// ============================================================================

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(attempts)
        .with_delays(Duration::from_millis(5), Duration::from_millis(20))
        .with_jitter(false)
}

async fn core_for(service: ServiceConfig) -> ResilienceCore {
    ResilienceCore::builder()
        .config(Config {
            services: vec![service],
            ..Config::default()
        })
        .build()
        .await
        .expect("Should build core")
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn test_retries_past_transient_503() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stock/42"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stock/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "units": 7 })))
        .expect(1)
        .mount(&server)
        .await;

    let core = core_for(ServiceConfig::new("inventory", server.uri()).with_retry(fast_retry(3)))
        .await;
    let response = core
        .execute("inventory", ServiceRequest::get("/stock/42"))
        .await
        .expect("Should succeed on second attempt");

    assert_eq!(response.status, 200);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["units"], 7);

    // One failure then a success leaves the breaker closed and reset.
    let state = core.breaker_state("inventory").await.unwrap();
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.failure_count, 0);
}

#[tokio::test]
async fn test_exhausted_retries_report_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let core = core_for(ServiceConfig::new("inventory", server.uri()).with_retry(fast_retry(2)))
        .await;
    let err = core
        .execute("inventory", ServiceRequest::get("/"))
        .await
        .unwrap_err();

    match &err {
        Error::Connectivity {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(*attempts, 2);
            assert!(last_error.contains("502"), "last error: {last_error}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.http_status(), 502);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let core = core_for(ServiceConfig::new("inventory", server.uri()).with_retry(fast_retry(3)))
        .await;
    let response = core
        .execute("inventory", ServiceRequest::get("/missing"))
        .await
        .expect("Should return the 404 response");
    assert_eq!(response.status, 404);
    assert!(!response.is_success());
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_default_headers_and_json_body_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/reservations"))
        .and(header("x-client", "bulwark"))
        .and(body_json(json!({ "sku": "A-1", "units": 2 })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let core = core_for(
        ServiceConfig::new("inventory", format!("{}/", server.uri()))
            .with_header("X-Client", "bulwark")
            .with_retry(RetryPolicy::no_retry()),
    )
    .await;
    let request =
        ServiceRequest::json("reservations", &json!({ "sku": "A-1", "units": 2 })).unwrap();
    let response = core.execute("inventory", request).await.unwrap();
    assert_eq!(response.status, 201);
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_slow_attempt_hits_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let core = core_for(
        ServiceConfig::new("inventory", server.uri())
            .with_retry(RetryPolicy::no_retry())
            .with_timeouts(ServiceTimeouts {
                connect_timeout_ms: 1_000,
                request_timeout_ms: 100,
            }),
    )
    .await;
    let err = core
        .execute("inventory", ServiceRequest::get("/"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connectivity { attempts: 1, .. }), "{err:?}");
    assert_eq!(core.breaker_state("inventory").await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn test_deadline_bounds_the_whole_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let core = core_for(ServiceConfig::new("inventory", server.uri()).with_retry(fast_retry(3)))
        .await;
    let err = core
        .execute_with_deadline(
            "inventory",
            ServiceRequest::get("/"),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { timeout_ms: 100, .. }), "{err:?}");
}
