//! Request/response bodies for the router API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Probe response for liveness/readiness/startup.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeResponse {
    /// UP or DOWN
    pub status: String,
    pub timestamp: String,
    pub issues: Vec<String>,
}

/// Request to publish one pointer.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessageRequest {
    pub message_id: Option<String>,
    #[serde(default)]
    pub pool_code: Option<String>,
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(default)]
    pub message_deduplication_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessageResponse {
    pub message_id: String,
    pub status: String,
}

/// Seed request for load/integration testing.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SeedMessageRequest {
    pub count: Option<u32>,
    pub queue: Option<String>,
    pub endpoint: Option<String>,
    #[serde(rename = "messageGroupMode")]
    pub message_group_mode: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SeedMessageResponse {
    pub status: String,
    #[serde(rename = "messagesSent", skip_serializing_if = "Option::is_none")]
    pub messages_sent: Option<u32>,
    #[serde(rename = "totalRequested", skip_serializing_if = "Option::is_none")]
    pub total_requested: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Pool resize/rate-limit update.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolUpdateRequest {
    pub concurrency: Option<u32>,
    pub rate_limit_per_minute: Option<u32>,
    pub callback_url: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClearOldWarningsQuery {
    /// Warnings older than this many hours are removed.
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct InFlightQuery {
    pub limit: Option<usize>,
    #[serde(rename = "messageId")]
    pub message_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StandbyStatusResponse {
    pub standby_enabled: bool,
    pub instance_id: String,
    pub is_primary: bool,
}
