//! HTTP outcome mapping against a wiremock target:
//! 2xx ack → SUCCESS, 2xx nack → DEFERRED, 4xx → ERROR_CONFIG,
//! 5xx retried then ERROR_PROCESS, connection failure → ERROR_CONNECTION.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rp_common::{MediationResult, MessagePointer};
use rp_router::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use rp_router::mediator::{HttpMediator, HttpMediatorConfig, Mediator};
use rp_router::signature::{CORRELATION_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

fn pointer(id: &str) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: "TEST".to_string(),
        message_group_id: Some("g".to_string()),
        message_deduplication_id: None,
        payload: serde_json::json!({"orderId": id}),
        auth_token: None,
        signing_secret: None,
        callback_url: None,
        correlation_id: None,
        causation_id: None,
    }
}

fn mediator() -> HttpMediator {
    mediator_with_retries(3)
}

fn mediator_with_retries(retries: u32) -> HttpMediator {
    HttpMediator::new(
        HttpMediatorConfig {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            headers_timeout: Duration::from_secs(5),
            retries,
            retry_delay: Duration::from_millis(10),
        },
        Arc::new(CircuitBreakerRegistry::default()),
    )
}

#[tokio::test]
async fn ok_with_ack_true_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = mediator()
        .mediate(&pointer("m-1"), &format!("{}/hook", server.uri()))
        .await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn ok_with_ack_false_is_deferred_with_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"ack": false, "delaySeconds": 30})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = mediator()
        .mediate(&pointer("m-1"), &format!("{}/hook", server.uri()))
        .await;

    assert_eq!(outcome.result, MediationResult::Deferred);
    assert_eq!(outcome.delay_seconds, Some(30));
}

#[tokio::test]
async fn client_error_is_config_error_and_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = mediator()
        .mediate(&pointer("m-1"), &format!("{}/hook", server.uri()))
        .await;

    assert_eq!(outcome.result, MediationResult::ErrorConfig);
    assert_eq!(outcome.status_code, Some(400));
}

#[tokio::test]
async fn server_error_retries_then_error_process() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3) // retries=3 means three attempts total
        .mount(&server)
        .await;

    let outcome = mediator_with_retries(3)
        .mediate(&pointer("m-1"), &format!("{}/hook", server.uri()))
        .await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.status_code, Some(503));
}

#[tokio::test]
async fn retry_recovers_on_late_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .mount(&server)
        .await;

    let outcome = mediator_with_retries(3)
        .mediate(&pointer("m-1"), &format!("{}/hook", server.uri()))
        .await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn connection_failure_is_error_connection() {
    // Nothing listens on this port
    let outcome = mediator()
        .mediate(&pointer("m-1"), "http://127.0.0.1:9/hook")
        .await;

    assert_eq!(outcome.result, MediationResult::ErrorConnection);
}

#[tokio::test]
async fn signed_requests_carry_signature_and_tracing_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists(SIGNATURE_HEADER))
        .and(header_exists(TIMESTAMP_HEADER))
        .and(header_exists(CORRELATION_HEADER))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let mut signed = pointer("m-1");
    signed.signing_secret = Some("hook-secret".to_string());
    signed.correlation_id = Some("corr-1".to_string());

    let outcome = mediator()
        .mediate(&signed, &format!("{}/hook", server.uri()))
        .await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn open_circuit_rejects_without_calling_target() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(0)
        .mount(&server)
        .await;

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_rate_threshold: 0.5,
        minimum_calls: 2,
        wait_duration: Duration::from_secs(3600),
        permitted_calls_in_half_open: 1,
        sliding_window_size: 10,
    }));
    let target = format!("{}/hook", server.uri());

    // Trip the breaker out of band
    breakers.record_failure(&target);
    breakers.record_failure(&target);

    let mediator = HttpMediator::new(
        HttpMediatorConfig {
            retries: 3,
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        },
        breakers,
    );

    let outcome = mediator.mediate(&pointer("m-1"), &target).await;

    // Rejection maps to ERROR_CONNECTION and is not retried in-call
    assert_eq!(outcome.result, MediationResult::ErrorConnection);
}
