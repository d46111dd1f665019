//! Background task supervisor for the router.
//!
//! Spawns the periodic maintenance loops: visibility extension for
//! long-running messages, pipeline-map leak checks, consumer auto-restart,
//! warning housekeeping, health reporting, queue and broker health
//! monitors, and configuration sync. All loops stop on the shared
//! shutdown channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker_health::{spawn_broker_health_monitor, BrokerHealthMonitor};
use crate::config_sync::{spawn_config_sync_task, ConfigSyncService};
use crate::health::HealthService;
use crate::manager::QueueManager;
use crate::queue_health::QueueHealthMonitor;
use crate::warning::WarningService;
use rp_common::{WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub visibility_extension_interval: Duration,
    pub pipeline_health_interval: Duration,
    pub consumer_health_interval: Duration,
    pub warning_cleanup_interval: Duration,
    pub health_report_interval: Duration,
    pub draining_pool_cleanup_interval: Duration,
    pub consumer_restart_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            visibility_extension_interval: Duration::from_secs(55),
            pipeline_health_interval: Duration::from_secs(60),
            consumer_health_interval: Duration::from_secs(30),
            warning_cleanup_interval: Duration::from_secs(300),
            health_report_interval: Duration::from_secs(60),
            draining_pool_cleanup_interval: Duration::from_secs(10),
            consumer_restart_delay: Duration::from_secs(5),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    warning_service: Arc<WarningService>,
    health_service: Arc<HealthService>,
    config_sync: Option<Arc<ConfigSyncService>>,
}

impl LifecycleManager {
    /// Start every maintenance loop and return the supervisor handle.
    pub fn start(
        manager: Arc<QueueManager>,
        warning_service: Arc<WarningService>,
        health_service: Arc<HealthService>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Visibility extension for long-running messages
        {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.visibility_extension_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("Extending visibility for long-running messages");
                            manager.extend_visibility_for_long_running().await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        // Pipeline map leak detection
        {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.pipeline_health_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            manager.check_pipeline_health().await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        // Draining-pool reaper
        {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.draining_pool_cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => manager.cleanup_draining_pools().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        // Consumer auto-restart with an attempt budget
        {
            let manager = manager.clone();
            let health_service = health_service.clone();
            let warning_service = warning_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.consumer_health_interval;
            let restart_delay = config.consumer_restart_delay;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                let mut restart_attempts: std::collections::HashMap<String, u32> =
                    std::collections::HashMap::new();
                const MAX_RESTART_ATTEMPTS: u32 = 3;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let stalled = health_service.get_stalled_consumers();
                            for consumer_id in stalled {
                                let attempts = restart_attempts.entry(consumer_id.clone()).or_insert(0);

                                if *attempts < MAX_RESTART_ATTEMPTS {
                                    warn!(
                                        consumer_id = %consumer_id,
                                        attempt = *attempts + 1,
                                        "Stalled consumer, attempting restart"
                                    );
                                    warning_service.add_warning(
                                        WarningCategory::ConsumerRestart,
                                        WarningSeverity::Warning,
                                        format!(
                                            "Consumer {consumer_id} stalled, restart attempt {}",
                                            *attempts + 1
                                        ),
                                        "LifecycleManager".to_string(),
                                    );

                                    tokio::time::sleep(restart_delay).await;
                                    if manager.restart_consumer(&consumer_id).await {
                                        *attempts += 1;
                                    }
                                } else {
                                    error!(
                                        consumer_id = %consumer_id,
                                        attempts = *attempts,
                                        "Consumer restart budget exhausted"
                                    );
                                    warning_service.add_warning(
                                        WarningCategory::ConsumerRestartFailed,
                                        WarningSeverity::Critical,
                                        format!(
                                            "Consumer {consumer_id} restart failed after {} attempts",
                                            *attempts
                                        ),
                                        "LifecycleManager".to_string(),
                                    );
                                }
                            }

                            // A consumer that recovered gets its budget back
                            let stalled_now = health_service.get_stalled_consumers();
                            restart_attempts.retain(|id, _| stalled_now.contains(id));
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        // Warning housekeeping
        {
            let warning_service = warning_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.warning_cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => warning_service.cleanup(),
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        // Health report logging
        {
            let manager = manager.clone();
            let health_service = health_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.health_report_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let pool_stats = manager.get_pool_stats();
                            let report = health_service.get_health_report(&pool_stats);
                            if report.issues.is_empty() {
                                debug!(status = ?report.status, "Health report OK");
                            } else {
                                warn!(status = ?report.status, issues = ?report.issues, "Health report");
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        info!("Lifecycle manager started");

        Self {
            shutdown_tx,
            warning_service,
            health_service,
            config_sync: None,
        }
    }

    /// Start with the optional monitors attached.
    pub fn start_with_monitors(
        manager: Arc<QueueManager>,
        warning_service: Arc<WarningService>,
        health_service: Arc<HealthService>,
        config: LifecycleConfig,
        queue_health: Option<Arc<QueueHealthMonitor>>,
        broker_health: Option<Arc<BrokerHealthMonitor>>,
        config_sync: Option<Arc<ConfigSyncService>>,
    ) -> Self {
        let mut lifecycle = Self::start(manager.clone(), warning_service, health_service, config);

        if let Some(monitor) = queue_health {
            let interval = monitor.config().check_interval;
            let mut shutdown_rx = lifecycle.shutdown_tx.subscribe();
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let metrics = manager.get_queue_metrics().await;
                            monitor.check_queue_health(&metrics);
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        if let Some(monitor) = broker_health {
            spawn_broker_health_monitor(monitor, lifecycle.shutdown_tx.clone());
        }

        if let Some(ref sync_service) = config_sync {
            if sync_service.is_enabled() {
                info!("Starting configuration sync task");
                spawn_config_sync_task(sync_service.clone(), lifecycle.shutdown_tx.clone());
            }
        }
        lifecycle.config_sync = config_sync;

        lifecycle
    }

    pub fn warning_service(&self) -> &Arc<WarningService> {
        &self.warning_service
    }

    pub fn health_service(&self) -> &Arc<HealthService> {
        &self.health_service
    }

    pub fn config_sync(&self) -> Option<&Arc<ConfigSyncService>> {
        self.config_sync.as_ref()
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn shutdown(&self) {
        info!("Lifecycle manager shutting down");
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals() {
        let config = LifecycleConfig::default();
        assert_eq!(config.visibility_extension_interval, Duration::from_secs(55));
        assert_eq!(config.warning_cleanup_interval, Duration::from_secs(300));
    }
}
