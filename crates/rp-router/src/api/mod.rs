//! Router HTTP API.
//!
//! Probes, monitoring endpoints, warning and circuit-breaker management,
//! traffic transitions, message publishing, and the deterministic test
//! endpoints used by integration tests.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::breaker::{CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
use crate::health::HealthService;
use crate::manager::{InFlightMessageInfo, QueueManager};
use crate::traffic::{TrafficManager, TrafficStatus};
use crate::warning::WarningService;
use rp_common::{
    ConsumerHealth, HealthReport, HealthStatus, InfrastructureHealth, MessagePointer, PoolConfig,
    PoolStats, Warning, WarningSeverity,
};
use rp_queue::QueuePublisher;

pub mod model;

pub use model::*;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<dyn QueuePublisher>,
    pub manager: Arc<QueueManager>,
    pub warning_service: Arc<WarningService>,
    pub health_service: Arc<HealthService>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub traffic: Arc<TrafficManager>,
    pub standby_enabled: bool,
    pub instance_id: String,
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Relaypoint Router API",
        version = "0.1.0",
        description = "Message routing, health monitoring, and pool management"
    ),
    paths(
        liveness_probe,
        readiness_probe,
        monitoring_health,
        queue_stats,
        pool_stats,
        update_pool,
        circuit_breakers,
        circuit_breaker_reset,
        circuit_breaker_reset_all,
        warnings_list,
        warning_acknowledge,
        warnings_clear,
        warnings_clear_old,
        in_flight_messages,
        consumer_health,
        standby_status,
        traffic_status,
        infrastructure_health,
        become_primary,
        become_standby,
        seed_messages,
        publish_message,
    ),
    components(schemas(
        ProbeResponse,
        PublishMessageRequest,
        PublishMessageResponse,
        SeedMessageRequest,
        SeedMessageResponse,
        PoolUpdateRequest,
        StandbyStatusResponse,
        HealthReport,
        HealthStatus,
        PoolStats,
        rp_common::WindowStats,
        Warning,
        rp_common::WarningCategory,
        rp_common::WarningSeverity,
        CircuitBreakerStats,
        CircuitState,
        InFlightMessageInfo,
        ConsumerHealth,
        InfrastructureHealth,
        TrafficStatus,
        crate::traffic::TrafficRole,
    )),
    tags(
        (name = "health", description = "Probes and health summaries"),
        (name = "monitoring", description = "Operational visibility"),
        (name = "warnings", description = "Warning management"),
        (name = "circuit-breakers", description = "Circuit breaker management"),
        (name = "traffic", description = "Primary/standby transitions"),
        (name = "messages", description = "Message publishing"),
        (name = "test", description = "Deterministic test endpoints"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // Probes
        .route("/health", get(liveness_probe))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/health/startup", get(readiness_probe))
        // Prometheus
        .route("/metrics", get(metrics_endpoint))
        // Monitoring
        .route("/monitoring/health", get(monitoring_health))
        .route("/monitoring/queue-stats", get(queue_stats))
        .route("/monitoring/pool-stats", get(pool_stats))
        .route("/monitoring/pools/{pool_code}", put(update_pool))
        .route("/monitoring/circuit-breakers", get(circuit_breakers))
        .route("/monitoring/circuit-breakers/{name}/reset", post(circuit_breaker_reset))
        .route("/monitoring/circuit-breakers/reset-all", post(circuit_breaker_reset_all))
        .route("/monitoring/warnings", get(warnings_list).delete(warnings_clear))
        .route("/monitoring/warnings/old", delete(warnings_clear_old))
        .route("/monitoring/warnings/{id}/acknowledge", post(warning_acknowledge))
        .route("/monitoring/in-flight-messages", get(in_flight_messages))
        .route("/monitoring/consumer-health", get(consumer_health))
        .route("/monitoring/standby-status", get(standby_status))
        .route("/monitoring/traffic-status", get(traffic_status))
        .route("/monitoring/infrastructure-health", get(infrastructure_health))
        .route("/monitoring/become-primary", post(become_primary))
        .route("/monitoring/become-standby", post(become_standby))
        // Seeding and test endpoints
        .route("/api/seed/messages", post(seed_messages))
        .route("/api/test/fast", post(test_fast))
        .route("/api/test/slow", post(test_slow))
        .route("/api/test/faulty", post(test_faulty))
        .route("/api/test/fail", post(test_fail))
        .route("/api/test/success", post(test_success))
        .route("/api/test/pending", post(test_pending))
        .route("/api/test/client-error", post(test_client_error))
        .route("/api/test/server-error", post(test_server_error))
        .route("/api/test/stats", get(test_stats))
        .route("/api/test/stats/reset", post(reset_test_stats))
        // Publishing
        .route("/messages", post(publish_message))
        .with_state(state)
}

// ============================================================================
// Probes
// ============================================================================

fn probe_response(state: &AppState) -> (bool, ProbeResponse) {
    let pool_stats = state.manager.get_pool_stats();
    let report = state.health_service.get_health_report(&pool_stats);
    let healthy = report.status != HealthStatus::Degraded && state.manager.is_running();

    let response = ProbeResponse {
        status: if healthy { "UP" } else { "DOWN" }.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        issues: report.issues,
    };
    (healthy, response)
}

/// Liveness probe
#[utoipa::path(get, path = "/health/live", tag = "health",
    responses((status = 200, body = ProbeResponse), (status = 503, body = ProbeResponse)))]
async fn liveness_probe(State(state): State<AppState>) -> Response {
    // Live while the process responds and is not shutting down
    let response = ProbeResponse {
        status: if state.manager.is_running() { "UP" } else { "DOWN" }.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        issues: vec![],
    };
    if state.manager.is_running() {
        (StatusCode::OK, Json(response)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response()
    }
}

/// Readiness/startup probe
#[utoipa::path(get, path = "/health/ready", tag = "health",
    responses((status = 200, body = ProbeResponse), (status = 503, body = ProbeResponse)))]
async fn readiness_probe(State(state): State<AppState>) -> Response {
    let (healthy, response) = probe_response(&state);
    if healthy {
        (StatusCode::OK, Json(response)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response()
    }
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

// ============================================================================
// Monitoring
// ============================================================================

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct MonitoringHealthResponse {
    status: HealthStatus,
    report: HealthReport,
    in_flight_count: usize,
    open_circuit_breakers: usize,
}

/// System health summary
#[utoipa::path(get, path = "/monitoring/health", tag = "monitoring",
    responses((status = 200, description = "Health summary")))]
async fn monitoring_health(State(state): State<AppState>) -> Json<MonitoringHealthResponse> {
    let pool_stats = state.manager.get_pool_stats();
    let report = state.health_service.get_health_report(&pool_stats);
    Json(MonitoringHealthResponse {
        status: report.status,
        report,
        in_flight_count: state.manager.in_flight_count(),
        open_circuit_breakers: state.breakers.open_count(),
    })
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct QueueStatsEntry {
    queue_identifier: String,
    pending_messages: u64,
    in_flight_messages: u64,
    total_polled: u64,
    total_acked: u64,
    total_nacked: u64,
    total_deferred: u64,
}

/// Per-queue depth and throughput
#[utoipa::path(get, path = "/monitoring/queue-stats", tag = "monitoring",
    responses((status = 200, description = "Queue statistics")))]
async fn queue_stats(State(state): State<AppState>) -> Json<Vec<QueueStatsEntry>> {
    let metrics = state.manager.get_queue_metrics().await;
    Json(
        metrics
            .into_iter()
            .map(|m| QueueStatsEntry {
                queue_identifier: m.queue_identifier,
                pending_messages: m.pending_messages,
                in_flight_messages: m.in_flight_messages,
                total_polled: m.total_polled,
                total_acked: m.total_acked,
                total_nacked: m.total_nacked,
                total_deferred: m.total_deferred,
            })
            .collect(),
    )
}

/// Per-pool statistics
#[utoipa::path(get, path = "/monitoring/pool-stats", tag = "monitoring",
    responses((status = 200, body = [PoolStats])))]
async fn pool_stats(State(state): State<AppState>) -> Json<Vec<PoolStats>> {
    Json(state.manager.get_pool_stats())
}

/// Resize a pool or adjust its rate limit in place
#[utoipa::path(put, path = "/monitoring/pools/{pool_code}", tag = "monitoring",
    request_body = PoolUpdateRequest,
    responses((status = 200, description = "Pool updated"), (status = 404)))]
async fn update_pool(
    State(state): State<AppState>,
    Path(pool_code): Path<String>,
    Json(request): Json<PoolUpdateRequest>,
) -> Response {
    let Some(pool) = state.manager.get_pool(&pool_code) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("pool {pool_code} not found")})),
        )
            .into_response();
    };

    let config = PoolConfig {
        code: pool_code.clone(),
        concurrency: request.concurrency.unwrap_or_else(|| pool.concurrency()),
        rate_limit_per_minute: request.rate_limit_per_minute.or(pool.rate_limit_per_minute()),
        callback_url: request.callback_url.or(pool.callback_url()),
        timeout_ms: None,
        retries: None,
    };

    match state.manager.update_pool_config(&pool_code, config).await {
        Ok(()) => Json(serde_json::json!({"status": "updated", "poolCode": pool_code})).into_response(),
        Err(e) => e.into_response(),
    }
}

/// All circuit breaker stats
#[utoipa::path(get, path = "/monitoring/circuit-breakers", tag = "circuit-breakers",
    responses((status = 200, description = "Breaker stats by endpoint")))]
async fn circuit_breakers(
    State(state): State<AppState>,
) -> Json<std::collections::HashMap<String, CircuitBreakerStats>> {
    Json(state.breakers.all_stats())
}

/// Reset one circuit breaker to CLOSED
#[utoipa::path(post, path = "/monitoring/circuit-breakers/{name}/reset", tag = "circuit-breakers",
    responses((status = 200), (status = 404)))]
async fn circuit_breaker_reset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    if state.breakers.reset(&name) {
        Json(serde_json::json!({"status": "reset", "name": name})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("circuit breaker {name} not found")})),
        )
            .into_response()
    }
}

/// Reset every circuit breaker
#[utoipa::path(post, path = "/monitoring/circuit-breakers/reset-all", tag = "circuit-breakers",
    responses((status = 200)))]
async fn circuit_breaker_reset_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.breakers.reset_all();
    Json(serde_json::json!({"status": "reset-all"}))
}

/// List warnings, optionally filtered by severity or acknowledged state
#[utoipa::path(get, path = "/monitoring/warnings", tag = "warnings",
    responses((status = 200, body = [Warning])))]
async fn warnings_list(
    State(state): State<AppState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Json<Vec<Warning>> {
    let mut warnings = match params.get("severity").map(|s| s.to_uppercase()) {
        Some(s) => {
            let severity = match s.as_str() {
                "INFO" => Some(WarningSeverity::Info),
                "WARNING" | "WARN" => Some(WarningSeverity::Warning),
                "ERROR" => Some(WarningSeverity::Error),
                "CRITICAL" => Some(WarningSeverity::Critical),
                _ => None,
            };
            match severity {
                Some(severity) => state.warning_service.get_warnings_by_severity(severity),
                None => state.warning_service.get_all_warnings(),
            }
        }
        None => state.warning_service.get_all_warnings(),
    };

    if let Some(acknowledged) = params.get("acknowledged").and_then(|v| v.parse::<bool>().ok()) {
        warnings.retain(|w| w.acknowledged == acknowledged);
    }

    warnings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(warnings)
}

/// Acknowledge one warning
#[utoipa::path(post, path = "/monitoring/warnings/{id}/acknowledge", tag = "warnings",
    responses((status = 200), (status = 404)))]
async fn warning_acknowledge(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.warning_service.acknowledge_warning(&id) {
        Json(serde_json::json!({"status": "acknowledged", "id": id})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("warning {id} not found")})),
        )
            .into_response()
    }
}

/// Clear all warnings
#[utoipa::path(delete, path = "/monitoring/warnings", tag = "warnings",
    responses((status = 200)))]
async fn warnings_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.warning_service.clear_all();
    Json(serde_json::json!({"removed": removed}))
}

/// Clear warnings older than ?hours=N (default 24)
#[utoipa::path(delete, path = "/monitoring/warnings/old", tag = "warnings",
    responses((status = 200)))]
async fn warnings_clear_old(
    State(state): State<AppState>,
    Query(query): Query<ClearOldWarningsQuery>,
) -> Json<serde_json::Value> {
    let hours = query.hours.unwrap_or(24);
    let removed = state.warning_service.clear_old_warnings(hours);
    Json(serde_json::json!({"removed": removed, "hours": hours}))
}

/// Messages currently in flight, oldest first
#[utoipa::path(get, path = "/monitoring/in-flight-messages", tag = "monitoring",
    responses((status = 200, body = [InFlightMessageInfo])))]
async fn in_flight_messages(
    State(state): State<AppState>,
    Query(query): Query<InFlightQuery>,
) -> Json<Vec<InFlightMessageInfo>> {
    let limit = query.limit.unwrap_or(100).min(1000);
    Json(
        state
            .manager
            .get_in_flight_messages(limit, query.message_id.as_deref()),
    )
}

/// Per-consumer poll health
#[utoipa::path(get, path = "/monitoring/consumer-health", tag = "monitoring",
    responses((status = 200, body = [ConsumerHealth])))]
async fn consumer_health(State(state): State<AppState>) -> Json<Vec<ConsumerHealth>> {
    Json(state.health_service.all_consumer_health())
}

/// Standby status for this node
#[utoipa::path(get, path = "/monitoring/standby-status", tag = "traffic",
    responses((status = 200, body = StandbyStatusResponse)))]
async fn standby_status(State(state): State<AppState>) -> Json<StandbyStatusResponse> {
    Json(StandbyStatusResponse {
        standby_enabled: state.standby_enabled,
        instance_id: state.instance_id.clone(),
        is_primary: state.traffic.is_primary(),
    })
}

/// Traffic role and strategy status
#[utoipa::path(get, path = "/monitoring/traffic-status", tag = "traffic",
    responses((status = 200, body = TrafficStatus)))]
async fn traffic_status(State(state): State<AppState>) -> Json<TrafficStatus> {
    Json(state.traffic.status().await)
}

/// Aggregate infrastructure health (brokers + consumers)
#[utoipa::path(get, path = "/monitoring/infrastructure-health", tag = "monitoring",
    responses((status = 200, body = InfrastructureHealth)))]
async fn infrastructure_health(State(state): State<AppState>) -> Json<InfrastructureHealth> {
    let pool_stats = state.manager.get_pool_stats();
    let report = state.health_service.get_health_report(&pool_stats);
    let healthy = report.status == HealthStatus::Healthy;

    Json(InfrastructureHealth {
        healthy,
        message: if healthy {
            "all infrastructure components healthy".to_string()
        } else {
            format!("{} issues detected", report.issues.len())
        },
        issues: report.issues,
    })
}

/// Assume the PRIMARY role: register with the traffic strategy and resume
/// consumers
#[utoipa::path(post, path = "/monitoring/become-primary", tag = "traffic",
    responses((status = 200), (status = 500)))]
async fn become_primary(State(state): State<AppState>) -> Response {
    match state.traffic.become_primary().await {
        Ok(()) => Json(serde_json::json!({"status": "primary"})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Assume the STANDBY role: deregister and pause consumers
#[utoipa::path(post, path = "/monitoring/become-standby", tag = "traffic",
    responses((status = 200)))]
async fn become_standby(State(state): State<AppState>) -> Response {
    match state.traffic.become_standby().await {
        Ok(()) => Json(serde_json::json!({"status": "standby"})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

// ============================================================================
// Publishing & Seeding
// ============================================================================

/// Publish one pointer to the queue
#[utoipa::path(post, path = "/messages", tag = "messages",
    request_body = PublishMessageRequest,
    responses((status = 200, body = PublishMessageResponse), (status = 500)))]
async fn publish_message(
    State(state): State<AppState>,
    Json(request): Json<PublishMessageRequest>,
) -> Response {
    let pointer = MessagePointer {
        id: request.message_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        pool_code: request.pool_code.unwrap_or_default(),
        message_group_id: request.message_group_id,
        message_deduplication_id: request.message_deduplication_id,
        payload: request.payload,
        auth_token: request.auth_token,
        signing_secret: None,
        callback_url: request.callback_url,
        correlation_id: None,
        causation_id: None,
    };

    match state.publisher.publish(pointer).await {
        Ok(message_id) => Json(PublishMessageResponse {
            message_id,
            status: "published".to_string(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Seed test messages against the built-in test endpoints
#[utoipa::path(post, path = "/api/seed/messages", tag = "test",
    request_body = SeedMessageRequest,
    responses((status = 200, body = SeedMessageResponse)))]
async fn seed_messages(
    State(state): State<AppState>,
    Json(request): Json<SeedMessageRequest>,
) -> Json<SeedMessageResponse> {
    let count = request.count.unwrap_or(10).min(1000);
    let endpoint = request.endpoint.unwrap_or_else(|| "fast".to_string());
    let _queue = request.queue.unwrap_or_else(|| "default".to_string());
    let group_mode = request
        .message_group_mode
        .unwrap_or_else(|| "unique".to_string());

    let target = match endpoint.as_str() {
        "fast" => "http://localhost:8080/api/test/fast",
        "slow" => "http://localhost:8080/api/test/slow",
        "faulty" | "random" => "http://localhost:8080/api/test/faulty",
        "fail" => "http://localhost:8080/api/test/fail",
        other if other.starts_with("http") => other,
        _ => "http://localhost:8080/api/test/fast",
    };

    let mut sent = 0u32;
    for i in 0..count {
        let message_group_id = match group_mode.as_str() {
            "unique" => Some(format!("unique-{}", Uuid::new_v4())),
            "1of8" => Some(format!("group-{}", i % 8)),
            "single" => Some("single-group".to_string()),
            _ => None,
        };

        let pointer = MessagePointer {
            id: Uuid::new_v4().to_string(),
            pool_code: "DEFAULT".to_string(),
            message_group_id,
            message_deduplication_id: None,
            payload: serde_json::json!({"seed": i}),
            auth_token: None,
            signing_secret: None,
            callback_url: Some(target.to_string()),
            correlation_id: None,
            causation_id: None,
        };

        if state.publisher.publish(pointer).await.is_ok() {
            sent += 1;
        }
    }

    info!(sent = sent, requested = count, endpoint = %endpoint, "Seeded test messages");

    Json(SeedMessageResponse {
        status: "success".to_string(),
        messages_sent: Some(sent),
        total_requested: Some(count),
        message: None,
    })
}

// ============================================================================
// Deterministic Test Endpoints
// ============================================================================

static TEST_REQUEST_COUNT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

fn count_test_request() {
    TEST_REQUEST_COUNT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}

/// 100 ms then ack
async fn test_fast() -> Json<serde_json::Value> {
    count_test_request();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Json(serde_json::json!({ "status": "success", "ack": true }))
}

/// 60 s then ack
async fn test_slow() -> Json<serde_json::Value> {
    count_test_request();
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    Json(serde_json::json!({ "status": "success", "ack": true }))
}

/// 60% success / 20% client error / 20% server error
async fn test_faulty() -> Response {
    use rand::Rng;

    count_test_request();
    let roll: f64 = rand::rng().random();

    if roll < 0.6 {
        (StatusCode::OK, Json(serde_json::json!({ "status": "success", "ack": true })))
            .into_response()
    } else if roll < 0.8 {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "error", "error": "Client error" })),
        )
            .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "status": "error", "error": "Server error" })),
        )
            .into_response()
    }
}

/// Always 500
async fn test_fail() -> Response {
    count_test_request();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "status": "error", "error": "Always fails" })),
    )
        .into_response()
}

/// Always 200 with ack=true
async fn test_success() -> Json<serde_json::Value> {
    count_test_request();
    Json(serde_json::json!({ "ack": true, "message": "" }))
}

/// 200 with ack=false: asks the router to retry later
async fn test_pending() -> Json<serde_json::Value> {
    count_test_request();
    Json(serde_json::json!({ "ack": false, "message": "notBefore time not reached" }))
}

/// Always 400
async fn test_client_error() -> Response {
    count_test_request();
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "status": "error", "error": "Record not found" })),
    )
        .into_response()
}

/// Always 500
async fn test_server_error() -> Response {
    count_test_request();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "status": "error", "error": "Internal server error" })),
    )
        .into_response()
}

async fn test_stats() -> Json<serde_json::Value> {
    let count = TEST_REQUEST_COUNT.load(std::sync::atomic::Ordering::Relaxed);
    Json(serde_json::json!({ "totalRequests": count }))
}

async fn reset_test_stats() -> Json<serde_json::Value> {
    let previous = TEST_REQUEST_COUNT.swap(0, std::sync::atomic::Ordering::Relaxed);
    Json(serde_json::json!({ "previousCount": previous, "currentCount": 0 }))
}

// Circuit state re-export keeps the schema in the OpenAPI components.
#[allow(dead_code)]
fn _schema_anchor(_: CircuitState) {}
