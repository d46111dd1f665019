//! Periodic configuration sync from a central service.
//!
//! Fetches the router topology from a URL, hot-reloads it through the
//! queue manager, and raises CONFIG_SYNC_FAILED warnings on trouble. The
//! initial sync retries with a bounded budget; the router refuses to start
//! without a topology when `fail_on_initial_error` is set.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::manager::QueueManager;
use crate::warning::WarningService;
use rp_common::{RouterTopology, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct ConfigSyncConfig {
    pub enabled: bool,
    pub config_url: String,
    pub sync_interval: Duration,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub fail_on_initial_error: bool,
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_url: String::new(),
            sync_interval: Duration::from_secs(300),
            max_retry_attempts: 12,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            fail_on_initial_error: true,
        }
    }
}

pub struct ConfigSyncService {
    config: ConfigSyncConfig,
    manager: Arc<QueueManager>,
    warning_service: Arc<WarningService>,
    client: reqwest::Client,
    consecutive_failures: std::sync::atomic::AtomicU32,
}

impl ConfigSyncService {
    pub fn new(
        config: ConfigSyncConfig,
        manager: Arc<QueueManager>,
        warning_service: Arc<WarningService>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client construction");

        Self {
            config,
            manager,
            warning_service,
            client,
            consecutive_failures: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn fetch_topology(&self) -> anyhow::Result<RouterTopology> {
        let response = self
            .client
            .get(&self.config.config_url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("config endpoint returned HTTP {}", response.status());
        }

        Ok(response.json().await?)
    }

    /// Fetch the topology with the retry budget and apply it. Used at
    /// startup; an exhausted budget is fatal when configured so.
    pub async fn initial_sync(&self) -> anyhow::Result<RouterTopology> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.fetch_topology().await {
                Ok(topology) => {
                    info!(
                        pools = topology.processing_pools.len(),
                        queues = topology.queues.len(),
                        "Initial configuration fetched"
                    );
                    self.manager.apply_config(topology.clone()).await?;
                    return Ok(topology);
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = self.config.max_retry_attempts,
                        error = %e,
                        "Initial config fetch failed"
                    );
                    if attempt >= self.config.max_retry_attempts {
                        self.warning_service.add_warning(
                            WarningCategory::ConfigSyncFailed,
                            WarningSeverity::Critical,
                            format!("Initial config sync exhausted retries: {e}"),
                            "ConfigSyncService".to_string(),
                        );
                        return Err(e);
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// One periodic sync cycle. Failures warn with severity scaling by the
    /// consecutive-failure count.
    pub async fn sync_once(&self) {
        use std::sync::atomic::Ordering;

        match self.fetch_topology().await {
            Ok(topology) => {
                let failures = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if failures > 0 {
                    info!(previous_failures = failures, "Config sync recovered");
                }
                if let Err(e) = self.manager.reload_config(topology).await {
                    error!(error = %e, "Config reload failed");
                    self.warning_service.add_warning(
                        WarningCategory::ConfigSyncFailed,
                        WarningSeverity::Error,
                        format!("Config reload failed: {e}"),
                        "ConfigSyncService".to_string(),
                    );
                }
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(consecutive_failures = failures, error = %e, "Config sync failed");

                let severity = if failures >= 3 {
                    WarningSeverity::Critical
                } else {
                    WarningSeverity::Error
                };
                self.warning_service.add_warning(
                    WarningCategory::ConfigSyncFailed,
                    severity,
                    format!("Config sync failed ({failures} consecutive): {e}"),
                    "ConfigSyncService".to_string(),
                );
            }
        }
    }
}

pub fn spawn_config_sync_task(
    service: Arc<ConfigSyncService>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let interval = service.config.sync_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would re-apply the initial sync
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running config sync");
                    service.sync_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Config sync shutting down");
                    break;
                }
            }
        }
    })
}
