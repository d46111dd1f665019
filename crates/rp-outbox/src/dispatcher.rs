//! Batch dispatch to the platform API.
//!
//! Each item type posts to its own endpoint with body `{"items": [payload,
//! ...]}`. A 2xx carries per-item results; any other response maps the
//! whole batch to one status (timeouts count as gateway errors).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use rp_common::{OutboxItem, OutboxItemType, OutboxStatus};

/// Unexpected failure during dispatch: not an HTTP status, but a bug or
/// environmental fault that should split the batch by retry budget.
#[derive(Error, Debug)]
#[error("dispatch failed unexpectedly: {0}")]
pub struct DispatchPanic(pub String);

#[derive(Debug, Clone)]
pub struct OutboxDispatchResult {
    pub id: String,
    pub status: OutboxStatus,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait BatchDispatcher: Send + Sync {
    async fn dispatch_batch(
        &self,
        item_type: OutboxItemType,
        items: &[OutboxItem],
    ) -> Result<Vec<OutboxDispatchResult>, DispatchPanic>;
}

#[derive(Debug, Clone)]
pub struct HttpBatchDispatcherConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpBatchDispatcherConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            api_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct BatchRequestBody<'a> {
    items: Vec<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BatchResponseBody {
    results: Vec<BatchItemResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchItemResult {
    id: String,
    status: ItemStatus,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ItemStatus {
    Success,
    BadRequest,
    InternalError,
    Unauthorized,
    Forbidden,
    GatewayError,
}

impl ItemStatus {
    fn to_outbox_status(self) -> OutboxStatus {
        match self {
            ItemStatus::Success => OutboxStatus::Success,
            ItemStatus::BadRequest => OutboxStatus::BadRequest,
            ItemStatus::InternalError => OutboxStatus::InternalError,
            ItemStatus::Unauthorized => OutboxStatus::Unauthorized,
            ItemStatus::Forbidden => OutboxStatus::Forbidden,
            ItemStatus::GatewayError => OutboxStatus::GatewayError,
        }
    }
}

pub struct HttpBatchDispatcher {
    config: HttpBatchDispatcherConfig,
    client: reqwest::Client,
}

impl HttpBatchDispatcher {
    pub fn new(config: HttpBatchDispatcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn endpoint_for(&self, item_type: OutboxItemType) -> String {
        format!("{}{}", self.config.api_base_url, item_type.api_path())
    }

    fn whole_batch(
        items: &[OutboxItem],
        status: OutboxStatus,
        error: &str,
    ) -> Vec<OutboxDispatchResult> {
        items
            .iter()
            .map(|item| OutboxDispatchResult {
                id: item.id.clone(),
                status,
                error_message: Some(error.to_string()),
            })
            .collect()
    }
}

#[async_trait]
impl BatchDispatcher for HttpBatchDispatcher {
    async fn dispatch_batch(
        &self,
        item_type: OutboxItemType,
        items: &[OutboxItem],
    ) -> Result<Vec<OutboxDispatchResult>, DispatchPanic> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.endpoint_for(item_type);
        let body = BatchRequestBody {
            items: items.iter().map(|i| &i.payload).collect(),
        };

        debug!(url = %url, count = items.len(), item_type = %item_type, "Dispatching batch");

        let mut request = self.client.post(&url).json(&body);
        if let Some(ref token) = self.config.api_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    match response.json::<BatchResponseBody>().await {
                        Ok(parsed) => Ok(parsed
                            .results
                            .into_iter()
                            .map(|r| OutboxDispatchResult {
                                id: r.id,
                                status: r.status.to_outbox_status(),
                                error_message: r.error,
                            })
                            .collect()),
                        Err(e) => {
                            error!(error = %e, "Unparseable batch response");
                            Ok(Self::whole_batch(
                                items,
                                OutboxStatus::InternalError,
                                &format!("unparseable response: {e}"),
                            ))
                        }
                    }
                } else {
                    let outbox_status = match status.as_u16() {
                        400 => OutboxStatus::BadRequest,
                        401 => OutboxStatus::Unauthorized,
                        403 => OutboxStatus::Forbidden,
                        502 | 503 | 504 => OutboxStatus::GatewayError,
                        s if (500..600).contains(&s) => OutboxStatus::InternalError,
                        _ => OutboxStatus::BadRequest,
                    };

                    let body = response.text().await.unwrap_or_default();
                    warn!(status = %status, body = %body, "Batch request rejected");
                    Ok(Self::whole_batch(
                        items,
                        outbox_status,
                        &format!("HTTP {status}: {body}"),
                    ))
                }
            }
            Err(e) => {
                // Timeouts and connection failures map to GATEWAY_ERROR;
                // the platform may be briefly unreachable.
                warn!(error = %e, "Batch request failed");
                Ok(Self::whole_batch(
                    items,
                    OutboxStatus::GatewayError,
                    &format!("request failed: {e}"),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_status_mapping() {
        assert_eq!(ItemStatus::Success.to_outbox_status(), OutboxStatus::Success);
        assert_eq!(ItemStatus::GatewayError.to_outbox_status(), OutboxStatus::GatewayError);
        assert_eq!(ItemStatus::Unauthorized.to_outbox_status(), OutboxStatus::Unauthorized);
    }

    #[test]
    fn endpoints_per_type() {
        let dispatcher = HttpBatchDispatcher::new(HttpBatchDispatcherConfig {
            api_base_url: "http://platform:8080".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            dispatcher.endpoint_for(OutboxItemType::Event),
            "http://platform:8080/api/events/batch"
        );
        assert_eq!(
            dispatcher.endpoint_for(OutboxItemType::DispatchJob),
            "http://platform:8080/api/dispatch/jobs/batch"
        );
        assert_eq!(
            dispatcher.endpoint_for(OutboxItemType::AuditLog),
            "http://platform:8080/api/audit-logs/batch"
        );
    }
}
