//! HTTP mediation.
//!
//! Posts the pointer payload to the resolved callback URL and maps the
//! response to a processing outcome:
//!
//! - 2xx `{ack:true}` → SUCCESS
//! - 2xx `{ack:false, delaySeconds}` → DEFERRED
//! - 4xx → ERROR_CONFIG (never retried)
//! - 5xx / timeout → ERROR_PROCESS (retried with exponential backoff)
//! - network failure / open circuit → ERROR_CONNECTION
//!
//! Every call passes through the per-endpoint circuit breaker. A rejection
//! by an open circuit is ERROR_CONNECTION and is not retried within the
//! call.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::signature::{
    sign_now, CAUSATION_HEADER, CORRELATION_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use crate::warning::WarningService;
use rp_common::{
    MediationOutcome, MediationResult, MessagePointer, WarningCategory, WarningSeverity,
};

/// Response body from a mediation target. A missing `ack` means acked.
#[derive(Debug, Deserialize, Default)]
struct TargetResponse {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(rename = "delaySeconds")]
    delay_seconds: Option<u32>,
}

fn default_ack() -> bool {
    true
}

#[async_trait]
pub trait Mediator: Send + Sync {
    /// Deliver one pointer to its resolved target.
    async fn mediate(&self, pointer: &MessagePointer, target: &str) -> MediationOutcome;
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Time allowed for response headers to arrive.
    pub headers_timeout: Duration,
    /// Total attempts for ERROR_PROCESS outcomes.
    pub retries: u32,
    /// Backoff base; attempt n waits `retry_delay * 2^(n-1)`.
    pub retry_delay: Duration,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(900_000),
            headers_timeout: Duration::from_millis(30_000),
            retries: 3,
            retry_delay: Duration::from_millis(1_000),
        }
    }
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    warning_service: Option<Arc<WarningService>>,
}

impl HttpMediator {
    pub fn new(config: HttpMediatorConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.headers_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("reqwest client construction is infallible with these options");

        info!(
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            retries = config.retries,
            "HttpMediator initialized"
        );

        Self {
            client,
            config,
            breakers,
            warning_service: None,
        }
    }

    pub fn with_warning_service(mut self, warning_service: Arc<WarningService>) -> Self {
        self.warning_service = Some(warning_service);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    fn warn_config(&self, pointer: &MessagePointer, target: &str, status: u16) {
        if let Some(ref ws) = self.warning_service {
            ws.add_warning(
                WarningCategory::Configuration,
                WarningSeverity::Error,
                format!("HTTP {status} for message {} at {target}", pointer.id),
                "HttpMediator".to_string(),
            );
        }
    }

    async fn mediate_once(&self, pointer: &MessagePointer, target: &str) -> MediationOutcome {
        if !self.breakers.try_acquire(target) {
            debug!(message_id = %pointer.id, target = %target, "Circuit open, rejecting");
            return MediationOutcome::error_connection("circuit breaker open".to_string());
        }

        let body = match serde_json::to_string(&pointer.payload) {
            Ok(b) => b,
            Err(e) => {
                return MediationOutcome::error_config(0, format!("unserializable payload: {e}"))
            }
        };

        let correlation_id = pointer
            .correlation_id
            .clone()
            .unwrap_or_else(|| pointer.id.clone());

        let mut request = self
            .client
            .post(target)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header(CORRELATION_HEADER, correlation_id);

        if let Some(ref causation_id) = pointer.causation_id {
            request = request.header(CAUSATION_HEADER, causation_id.clone());
        }

        if let Some(ref secret) = pointer.signing_secret {
            let (signature, timestamp) = sign_now(&body, secret);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        if let Some(ref token) = pointer.auth_token {
            request = request.bearer_auth(token);
        }

        match request.body(body).send().await {
            Ok(response) => {
                let status = response.status();
                let status_code = status.as_u16();

                if status.is_success() {
                    self.breakers.record_success(target);

                    let parsed = response
                        .text()
                        .await
                        .ok()
                        .and_then(|text| serde_json::from_str::<TargetResponse>(&text).ok())
                        .unwrap_or_default();

                    if !parsed.ack {
                        debug!(
                            message_id = %pointer.id,
                            delay_seconds = ?parsed.delay_seconds,
                            "Target deferred the message"
                        );
                        return MediationOutcome::deferred(parsed.delay_seconds, status_code);
                    }

                    debug!(message_id = %pointer.id, status = status_code, "Message delivered");
                    MediationOutcome::success()
                } else if status.is_client_error() {
                    // The call reached the target; a 4xx is its answer, not
                    // an endpoint failure.
                    self.breakers.record_success(target);
                    warn!(
                        message_id = %pointer.id,
                        status = status_code,
                        target = %target,
                        "Client error from mediation target"
                    );
                    self.warn_config(pointer, target, status_code);
                    MediationOutcome::error_config(
                        status_code,
                        format!("HTTP {status_code} from target"),
                    )
                } else if status.is_server_error() {
                    self.breakers.record_failure(target);
                    warn!(
                        message_id = %pointer.id,
                        status = status_code,
                        "Server error from mediation target"
                    );
                    MediationOutcome::error_process(
                        Some(status_code),
                        Some(30),
                        format!("HTTP {status_code} from target"),
                    )
                } else {
                    self.breakers.record_failure(target);
                    MediationOutcome::error_process(
                        Some(status_code),
                        Some(30),
                        format!("unexpected HTTP {status_code}"),
                    )
                }
            }
            Err(e) => {
                self.breakers.record_failure(target);

                if e.is_connect() {
                    warn!(message_id = %pointer.id, error = %e, "Connection failure");
                    MediationOutcome::error_connection(format!("connection failure: {e}"))
                } else if e.is_timeout() {
                    warn!(message_id = %pointer.id, error = %e, "Request timed out");
                    MediationOutcome::error_process(None, Some(30), format!("timeout: {e}"))
                } else {
                    error!(message_id = %pointer.id, target = %target, error = %e, "Request failed");
                    MediationOutcome::error_connection(format!("request failed: {e}"))
                }
            }
        }
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn mediate(&self, pointer: &MessagePointer, target: &str) -> MediationOutcome {
        let mut attempt = 1u32;

        loop {
            let outcome = self.mediate_once(pointer, target).await;

            // Only ERROR_PROCESS (5xx, timeout) is retried within a call
            if outcome.result != MediationResult::ErrorProcess {
                return outcome;
            }

            if attempt >= self.config.retries.max(1) {
                return outcome;
            }

            let backoff = self.config.retry_delay * 2u32.pow(attempt - 1);
            debug!(
                message_id = %pointer.id,
                attempt = attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying mediation"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}
