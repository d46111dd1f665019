//! Traffic manager: PRIMARY/STANDBY role transitions.
//!
//! PRIMARY accepts traffic and runs consumers; STANDBY pauses them.
//! Registered listeners hear every transition. A pluggable strategy
//! handles external registration (e.g. a load-balancer target group);
//! the default strategy does nothing.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficRole {
    Primary,
    Standby,
}

#[derive(Error, Debug)]
pub enum TrafficError {
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("deregistration failed: {0}")]
    DeregistrationFailed(String),

    #[error("load balancer API error: {0}")]
    AlbApi(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

/// External registration delegate. Opaque to the manager beyond these
/// three operations.
#[async_trait]
pub trait TrafficStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn register(&self) -> Result<(), TrafficError>;

    async fn deregister(&self) -> Result<(), TrafficError>;

    async fn is_registered(&self) -> Result<bool, TrafficError>;
}

/// Listener notified on role transitions; consumers subscribe to pause
/// and resume with the role.
#[async_trait]
pub trait TrafficListener: Send + Sync {
    async fn on_pause(&self);

    async fn on_resume(&self);
}

/// Strategy for deployments without an external balancer.
pub struct NoopTrafficStrategy;

#[async_trait]
impl TrafficStrategy for NoopTrafficStrategy {
    fn name(&self) -> &str {
        "NONE"
    }

    async fn register(&self) -> Result<(), TrafficError> {
        Ok(())
    }

    async fn deregister(&self) -> Result<(), TrafficError> {
        Ok(())
    }

    async fn is_registered(&self) -> Result<bool, TrafficError> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStatus {
    pub role: TrafficRole,
    pub strategy_type: String,
    pub registered: bool,
    pub last_operation: Option<String>,
    pub last_error: Option<String>,
}

pub struct TrafficManager {
    role_tx: watch::Sender<TrafficRole>,
    role_rx: watch::Receiver<TrafficRole>,
    strategy: Arc<dyn TrafficStrategy>,
    listeners: Mutex<Vec<Arc<dyn TrafficListener>>>,
    last_operation: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
}

impl TrafficManager {
    pub fn new(strategy: Arc<dyn TrafficStrategy>) -> Self {
        let (role_tx, role_rx) = watch::channel(TrafficRole::Primary);
        Self {
            role_tx,
            role_rx,
            strategy,
            listeners: Mutex::new(Vec::new()),
            last_operation: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn with_noop_strategy() -> Self {
        Self::new(Arc::new(NoopTrafficStrategy))
    }

    pub fn role(&self) -> TrafficRole {
        *self.role_rx.borrow()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == TrafficRole::Primary
    }

    pub fn subscribe(&self) -> watch::Receiver<TrafficRole> {
        self.role_rx.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn TrafficListener>) {
        self.listeners.lock().push(listener);
    }

    /// Register with the strategy, resume listeners, assume PRIMARY.
    pub async fn become_primary(&self) -> Result<(), TrafficError> {
        if self.role() == TrafficRole::Primary {
            return Ok(());
        }

        info!("Transitioning to PRIMARY");
        self.note_operation("become_primary");

        if let Err(e) = self.strategy.register().await {
            error!(error = %e, "Traffic strategy registration failed");
            *self.last_error.write() = Some(e.to_string());
            return Err(e);
        }

        let _ = self.role_tx.send(TrafficRole::Primary);

        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_resume().await;
        }

        *self.last_error.write() = None;
        info!("Now PRIMARY, consumers resumed");
        Ok(())
    }

    /// Deregister (the strategy waits out any deregistration delay), pause
    /// listeners, assume STANDBY.
    pub async fn become_standby(&self) -> Result<(), TrafficError> {
        if self.role() == TrafficRole::Standby {
            return Ok(());
        }

        info!("Transitioning to STANDBY");
        self.note_operation("become_standby");

        if let Err(e) = self.strategy.deregister().await {
            // The role change still proceeds: a node asked to stand down
            // must stop consuming even if the balancer call failed.
            warn!(error = %e, "Traffic strategy deregistration failed");
            *self.last_error.write() = Some(e.to_string());
        }

        let _ = self.role_tx.send(TrafficRole::Standby);

        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_pause().await;
        }

        info!("Now STANDBY, consumers paused");
        Ok(())
    }

    pub async fn status(&self) -> TrafficStatus {
        let registered = self.strategy.is_registered().await.unwrap_or(false);
        TrafficStatus {
            role: self.role(),
            strategy_type: self.strategy.name().to_string(),
            registered,
            last_operation: self.last_operation.read().clone(),
            last_error: self.last_error.read().clone(),
        }
    }

    fn note_operation(&self, op: &str) {
        *self.last_operation.write() = Some(format!("{op} at {}", Utc::now().to_rfc3339()));
    }
}

#[cfg(feature = "alb")]
pub mod alb {
    //! AWS ALB target-group strategy. Deregistration waits for the target
    //! to leave `draining` before returning.

    use super::*;
    use aws_sdk_elasticloadbalancingv2::types::TargetDescription;
    use aws_sdk_elasticloadbalancingv2::Client;
    use std::time::Duration;

    pub struct AlbTrafficStrategy {
        client: Client,
        target_group_arn: String,
        instance_id: String,
        port: i32,
        deregistration_timeout: Duration,
    }

    impl AlbTrafficStrategy {
        pub fn new(
            client: Client,
            target_group_arn: String,
            instance_id: String,
            port: i32,
        ) -> Self {
            Self {
                client,
                target_group_arn,
                instance_id,
                port,
                deregistration_timeout: Duration::from_secs(330),
            }
        }

        fn target(&self) -> TargetDescription {
            TargetDescription::builder()
                .id(&self.instance_id)
                .port(self.port)
                .build()
        }
    }

    #[async_trait]
    impl TrafficStrategy for AlbTrafficStrategy {
        fn name(&self) -> &str {
            "ALB"
        }

        async fn register(&self) -> Result<(), TrafficError> {
            self.client
                .register_targets()
                .target_group_arn(&self.target_group_arn)
                .targets(self.target())
                .send()
                .await
                .map_err(|e| TrafficError::RegistrationFailed(e.to_string()))?;
            Ok(())
        }

        async fn deregister(&self) -> Result<(), TrafficError> {
            self.client
                .deregister_targets()
                .target_group_arn(&self.target_group_arn)
                .targets(self.target())
                .send()
                .await
                .map_err(|e| TrafficError::DeregistrationFailed(e.to_string()))?;

            // Wait out the deregistration delay so in-flight requests drain
            let started = std::time::Instant::now();
            loop {
                if started.elapsed() > self.deregistration_timeout {
                    return Err(TrafficError::Timeout(
                        "target still draining after deregistration timeout".to_string(),
                    ));
                }

                match self.is_registered().await {
                    Ok(false) => return Ok(()),
                    Ok(true) => tokio::time::sleep(Duration::from_secs(5)).await,
                    Err(e) => return Err(e),
                }
            }
        }

        async fn is_registered(&self) -> Result<bool, TrafficError> {
            let health = self
                .client
                .describe_target_health()
                .target_group_arn(&self.target_group_arn)
                .targets(self.target())
                .send()
                .await
                .map_err(|e| TrafficError::AlbApi(e.to_string()))?;

            let descriptions = health.target_health_descriptions();
            if descriptions.is_empty() {
                return Ok(false);
            }

            Ok(descriptions.iter().any(|d| {
                d.target_health()
                    .and_then(|h| h.state())
                    .map(|s| s.as_str() != "unused" && s.as_str() != "unavailable")
                    .unwrap_or(false)
            }))
        }
    }
}
