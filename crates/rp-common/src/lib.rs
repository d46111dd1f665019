use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Message Pointer
// ============================================================================

/// Routing envelope published to a queue broker.
///
/// The pointer is immutable once published. `id` doubles as the idempotency
/// key, `pool_code` is the routing key and `message_group_id` the FIFO key.
/// The payload is opaque to the router; it is forwarded verbatim as the
/// mediation request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    #[serde(rename = "messageId")]
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    /// Optional publish-side dedup key; FIFO brokers suppress duplicates
    /// seen within their dedup window.
    #[serde(default)]
    pub message_deduplication_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Per-target webhook signing secret. When present the mediator signs
    /// the request body with HMAC-SHA256.
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Overrides the pool's callback URL when set.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub causation_id: Option<String>,
}

impl MessagePointer {
    /// Resolve the mediation target: pointer override first, pool default second.
    pub fn resolve_target<'a>(&'a self, pool_default: Option<&'a str>) -> Option<&'a str> {
        self.callback_url.as_deref().or(pool_default)
    }
}

/// A pointer received from a broker, with delivery metadata attached.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub pointer: MessagePointer,
    pub receipt_handle: String,
    /// Broker-side message id, distinct from the application message id.
    /// Used to tell redeliveries apart from externally requeued duplicates.
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
    pub receive_count: u32,
}

/// A pointer bundled with its completion channel, as handed to a pool.
#[derive(Debug)]
pub struct RoutedMessage {
    pub pointer: MessagePointer,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
    pub batch_id: Option<String>,
    pub ack_tx: tokio::sync::oneshot::Sender<AckNack>,
}

/// Completion signal sent back through a routed message's channel.
#[derive(Debug, Clone)]
pub enum AckNack {
    Ack,
    /// Failed processing; redeliver after the optional delay.
    Nack { delay_seconds: Option<u32> },
    /// Backpressure (rate limit, capacity, deferral). Same broker operation
    /// as a nack but never counted as a failure.
    Defer { delay_seconds: Option<u32> },
    ExtendVisibility { seconds: u32 },
}

// ============================================================================
// In-Flight Tracking
// ============================================================================

/// A message currently between fetch and terminal ack/nack.
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub message_id: String,
    pub broker_message_id: Option<String>,
    pub pool_code: String,
    pub queue_identifier: String,
    pub started_at: Instant,
    pub message_group_id: Option<String>,
    pub batch_id: Option<String>,
    /// Rotated when the broker redelivers with a fresh handle.
    pub receipt_handle: String,
}

impl InFlightMessage {
    pub fn new(
        pointer: &MessagePointer,
        broker_message_id: Option<String>,
        queue_identifier: String,
        batch_id: Option<String>,
        receipt_handle: String,
    ) -> Self {
        Self {
            message_id: pointer.id.clone(),
            broker_message_id,
            pool_code: pointer.pool_code.clone(),
            queue_identifier,
            started_at: Instant::now(),
            message_group_id: pointer.message_group_id.clone(),
            batch_id,
            receipt_handle,
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub code: String,
    /// Worker concurrency, 1..=1000.
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// Default mediation target for pointers without their own callback URL.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
}

impl PoolConfig {
    pub fn new(code: impl Into<String>, concurrency: u32) -> Self {
        Self {
            code: code.into(),
            concurrency,
            rate_limit_per_minute: None,
            callback_url: None,
            timeout_ms: None,
            retries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueBinding {
    pub name: String,
    pub uri: String,
    #[serde(default = "default_connections")]
    pub connections: u32,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: u32,
}

fn default_connections() -> u32 {
    1
}

fn default_visibility_timeout() -> u32 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTopology {
    pub processing_pools: Vec<PoolConfig>,
    pub queues: Vec<QueueBinding>,
}

// ============================================================================
// Mediation Outcomes
// ============================================================================

/// Terminal classification of one mediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediationResult {
    /// Delivered and acknowledged by the target.
    Success,
    /// Target asked for a retry later via `{ack:false}`.
    Deferred,
    /// 4xx from the target. Terminal for the pool worker.
    ErrorConfig,
    /// 5xx or timeout. Retryable.
    ErrorProcess,
    /// Network failure or open circuit. Retryable at the broker level.
    ErrorConnection,
    /// Cascading failure applied to the rest of a (batch, group).
    BatchFailed,
}

#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub delay_seconds: Option<u32>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl MediationOutcome {
    pub fn success() -> Self {
        Self {
            result: MediationResult::Success,
            delay_seconds: None,
            status_code: Some(200),
            error_message: None,
        }
    }

    pub fn deferred(delay_seconds: Option<u32>, status_code: u16) -> Self {
        Self {
            result: MediationResult::Deferred,
            delay_seconds,
            status_code: Some(status_code),
            error_message: None,
        }
    }

    pub fn error_config(status_code: u16, message: String) -> Self {
        Self {
            result: MediationResult::ErrorConfig,
            delay_seconds: None,
            status_code: Some(status_code),
            error_message: Some(message),
        }
    }

    pub fn error_process(status_code: Option<u16>, delay_seconds: Option<u32>, message: String) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            delay_seconds,
            status_code,
            error_message: Some(message),
        }
    }

    pub fn error_connection(message: String) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            delay_seconds: Some(5),
            status_code: None,
            error_message: Some(message),
        }
    }

    pub fn batch_failed(message: String) -> Self {
        Self {
            result: MediationResult::BatchFailed,
            delay_seconds: Some(1),
            status_code: None,
            error_message: Some(message),
        }
    }
}

// ============================================================================
// Outbox Model
// ============================================================================

/// Outbox item status, stored as an integer code in customer tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// 0 — awaiting processing
    Pending,
    /// 1 — delivered
    Success,
    /// 2 — 4xx, terminal
    BadRequest,
    /// 3 — 5xx, retryable
    InternalError,
    /// 4 — auth failure, retryable (token refresh is expected to fix it)
    Unauthorized,
    /// 5 — permission denied, terminal
    Forbidden,
    /// 6 — upstream gateway failure, retryable
    GatewayError,
    /// 9 — crash-recovery marker, set while a batch holds the item
    InProgress,
}

impl OutboxStatus {
    pub fn code(&self) -> i32 {
        match self {
            OutboxStatus::Pending => 0,
            OutboxStatus::Success => 1,
            OutboxStatus::BadRequest => 2,
            OutboxStatus::InternalError => 3,
            OutboxStatus::Unauthorized => 4,
            OutboxStatus::Forbidden => 5,
            OutboxStatus::GatewayError => 6,
            OutboxStatus::InProgress => 9,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => OutboxStatus::Success,
            2 => OutboxStatus::BadRequest,
            3 => OutboxStatus::InternalError,
            4 => OutboxStatus::Unauthorized,
            5 => OutboxStatus::Forbidden,
            6 => OutboxStatus::GatewayError,
            9 => OutboxStatus::InProgress,
            _ => OutboxStatus::Pending,
        }
    }

    /// Retryable statuses get another attempt while the retry budget lasts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OutboxStatus::InternalError | OutboxStatus::GatewayError | OutboxStatus::Unauthorized
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboxStatus::Success | OutboxStatus::BadRequest | OutboxStatus::Forbidden
        )
    }
}

impl Default for OutboxStatus {
    fn default() -> Self {
        OutboxStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxItemType {
    Event,
    DispatchJob,
    AuditLog,
}

impl OutboxItemType {
    pub const ALL: [OutboxItemType; 3] = [
        OutboxItemType::Event,
        OutboxItemType::DispatchJob,
        OutboxItemType::AuditLog,
    ];

    /// Platform batch endpoint path for this item type.
    pub fn api_path(&self) -> &'static str {
        match self {
            OutboxItemType::Event => "/api/events/batch",
            OutboxItemType::DispatchJob => "/api/dispatch/jobs/batch",
            OutboxItemType::AuditLog => "/api/audit-logs/batch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "EVENT" => Some(OutboxItemType::Event),
            "DISPATCH_JOB" | "DISPATCHJOB" => Some(OutboxItemType::DispatchJob),
            "AUDIT_LOG" | "AUDITLOG" => Some(OutboxItemType::AuditLog),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxItemType::Event => write!(f, "EVENT"),
            OutboxItemType::DispatchJob => write!(f, "DISPATCH_JOB"),
            OutboxItemType::AuditLog => write!(f, "AUDIT_LOG"),
        }
    }
}

/// A customer-database outbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: String,
    pub item_type: OutboxItemType,
    /// FIFO key; items sharing (type, group) are forwarded in order.
    pub message_group: Option<String>,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl OutboxItem {
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

// ============================================================================
// Warning Catalog
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCategory {
    QueueBacklog,
    QueueGrowing,
    QueueFull,
    QueueValidation,
    Mediation,
    Configuration,
    ConfigSyncFailed,
    PoolLimit,
    PipelineMapLeak,
    BrokerHealth,
    ConsumerRestart,
    ConsumerRestartFailed,
    Routing,
    ShutdownCleanupErrors,
    StandbyRedis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Health & Stats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pools_healthy: u32,
    pub pools_unhealthy: u32,
    pub consumers_healthy: u32,
    pub consumers_unhealthy: u32,
    pub active_warnings: u32,
    pub critical_warnings: u32,
    pub issues: Vec<String>,
}

/// Counters for one rolling stats window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub avg_processing_ms: f64,
    pub throughput_per_sec: f64,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_workers: u32,
    pub available_permits: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub message_group_count: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub is_rate_limited: bool,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_rate_limited: u64,
    pub last_5_min: WindowStats,
    pub last_30_min: WindowStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerHealth {
    pub queue_identifier: String,
    pub is_healthy: bool,
    pub is_running: bool,
    pub time_since_last_poll_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureHealth {
    pub healthy: bool,
    pub message: String,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_status_codes_round_trip() {
        for code in [0, 1, 2, 3, 4, 5, 6, 9] {
            assert_eq!(OutboxStatus::from_code(code).code(), code);
        }
        assert_eq!(OutboxStatus::from_code(42), OutboxStatus::Pending);
    }

    #[test]
    fn retryable_statuses() {
        assert!(OutboxStatus::InternalError.is_retryable());
        assert!(OutboxStatus::GatewayError.is_retryable());
        assert!(OutboxStatus::Unauthorized.is_retryable());
        assert!(!OutboxStatus::BadRequest.is_retryable());
        assert!(!OutboxStatus::Forbidden.is_retryable());
        assert!(!OutboxStatus::Success.is_retryable());
    }

    #[test]
    fn item_type_api_paths() {
        assert_eq!(OutboxItemType::Event.api_path(), "/api/events/batch");
        assert_eq!(OutboxItemType::DispatchJob.api_path(), "/api/dispatch/jobs/batch");
        assert_eq!(OutboxItemType::AuditLog.api_path(), "/api/audit-logs/batch");
    }

    #[test]
    fn item_type_parsing() {
        assert_eq!(OutboxItemType::parse("event"), Some(OutboxItemType::Event));
        assert_eq!(OutboxItemType::parse("dispatch-job"), Some(OutboxItemType::DispatchJob));
        assert_eq!(OutboxItemType::parse("AUDIT_LOG"), Some(OutboxItemType::AuditLog));
        assert_eq!(OutboxItemType::parse("bogus"), None);
    }

    #[test]
    fn pointer_target_resolution() {
        let mut pointer = MessagePointer {
            id: "m-1".into(),
            pool_code: "DEFAULT".into(),
            message_group_id: None,
            message_deduplication_id: None,
            payload: serde_json::json!({}),
            auth_token: None,
            signing_secret: None,
            callback_url: None,
            correlation_id: None,
            causation_id: None,
        };
        assert_eq!(pointer.resolve_target(Some("http://pool")), Some("http://pool"));
        pointer.callback_url = Some("http://override".into());
        assert_eq!(pointer.resolve_target(Some("http://pool")), Some("http://override"));
    }

    #[test]
    fn severity_ordering() {
        assert!(WarningSeverity::Critical > WarningSeverity::Error);
        assert!(WarningSeverity::Error > WarningSeverity::Warning);
        assert!(WarningSeverity::Warning > WarningSeverity::Info);
    }
}
