//! Integration tests for common outbound workflows.
//!
//! These tests go through the facade crate the way a service would.

use outbound::prelude::*;
use outbound::{CircuitBreakerError, Transport, parse_retry_after};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REQUEST_ID: ContextKey = ContextKey::from_static("request-id");
const PAYMENTS: CircuitBreakerKey = CircuitBreakerKey::from_static("payments");

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_config_loaded_from_json() {
    let retry: RetrySettings = serde_json::from_str(r#"{"max_retries": 2}"#).unwrap();
    let pool: PoolSettings =
        serde_json::from_str(r#"{"max_idle_per_host": 8, "max_connections_per_host": 32}"#).unwrap();

    let config = PipelineConfig::builder(Duration::from_secs(15))
        .retry(retry)
        .pool(pool)
        .build();
    assert!(config.validate().is_ok());

    let client = HttpClient::new(config).unwrap();
    assert_eq!(client.stage_names(), vec!["retry", "instrumentation"]);
}

#[test]
fn test_invalid_config_is_reported_at_construction() {
    let config = PipelineConfig::builder(Duration::from_secs(1))
        .retry(RetrySettings::default())
        .build();
    let err = HttpClient::new(config).unwrap_err();
    assert!(err.to_string().contains("worst case retry backoff"));

    let config = PipelineConfig::builder(Duration::ZERO).build();
    assert!(matches!(
        HttpClient::new(config),
        Err(ConfigError::InvalidTimeout(_))
    ));
}

#[test]
fn test_retry_after_parsing() {
    let now = SystemTime::now();
    assert_eq!(parse_retry_after("5", now), Some(Duration::from_secs(5)));
    assert_eq!(parse_retry_after("0", now), None);
    assert_eq!(parse_retry_after("not-a-date", now), None);
}

// =============================================================================
// Request Workflow Tests
// =============================================================================

#[tokio::test]
async fn test_request_id_propagation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-request-id", "abc-123"))
        .and(header("x-service", "checkout"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpClient::new(
        PipelineConfig::builder(Duration::from_secs(5))
            .base_url(server.uri())
            .headers(
                HeaderSettings::new()
                    .static_header("X-Service", "checkout")
                    .context_header("X-Request-ID", REQUEST_ID),
            )
            .build(),
    )
    .unwrap();

    let body = client
        .get("/cart")
        .value(REQUEST_ID, "abc-123")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_clients_share_breaker_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = HttpClient::new(
        PipelineConfig::builder(Duration::from_secs(5))
            .circuit_breaker(
                BreakerSettings::new(PAYMENTS)
                    .ready_to_trip(|counts| counts.consecutive_failures >= 2),
            )
            .build(),
    )
    .unwrap();
    let clone = client.clone();

    for c in [&client, &clone] {
        let err = c
            .execute_with_breaker(&PAYMENTS, || c.get(server.uri()).send())
            .await
            .unwrap_err();
        assert!(err.is_bad_response());
    }

    assert_eq!(client.breaker(&PAYMENTS).state(), CircuitState::Open);
    assert_eq!(clone.breaker(&PAYMENTS).state(), CircuitState::Open);
}

// =============================================================================
// Custom Transport Tests
// =============================================================================

struct Flaky {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Transport for Flaky {
    async fn send(&self, _request: outbound::Request) -> Result<Response> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Error::Connection("connection reset by peer".into()))
        } else {
            Ok(Response::from_parts(StatusCode::OK, HeaderMap::new(), "ok"))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_transport_with_retry() {
    let transport = Arc::new(Flaky {
        calls: AtomicUsize::new(0),
    });
    let client = HttpClient::with_transport(
        PipelineConfig::builder(Duration::from_secs(5))
            .retry(RetrySettings::new().max_retries(1))
            .build(),
        transport.clone(),
    )
    .unwrap();

    let response = client.delete("http://inventory.internal/items/9").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_generic_breaker_call() {
    let client = HttpClient::new(
        PipelineConfig::builder(Duration::from_secs(5))
            .circuit_breaker(BreakerSettings::new(PAYMENTS).ready_to_trip(|c| c.total_failures >= 1))
            .build(),
    )
    .unwrap();
    let breaker = client.breaker(&PAYMENTS);

    let err = breaker
        .call(|| async { Err::<(), _>("ledger unavailable") })
        .await
        .unwrap_err();
    assert!(matches!(err, CircuitBreakerError::Execution("ledger unavailable")));

    let err = breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap_err();
    assert!(err.is_rejected());
}
