//! Periodic broker liveness probing.
//!
//! Runs the cheapest roundtrip the broker supports on an interval. After a
//! run of consecutive failures a BROKER_HEALTH warning fires at ERROR
//! severity; an unexpected exception chain (as opposed to a clean negative
//! probe) escalates it to CRITICAL.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::warning::WarningService;
use rp_common::{WarningCategory, WarningSeverity};
use rp_queue::{BrokerProbe, BrokerProbeError};

#[derive(Debug, Clone)]
pub struct BrokerHealthConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    /// Consecutive failures before a warning is raised.
    pub failure_threshold: u32,
}

impl Default for BrokerHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_millis(60_000),
            failure_threshold: 3,
        }
    }
}

pub struct BrokerHealthMonitor {
    config: BrokerHealthConfig,
    probe: Arc<dyn BrokerProbe>,
    warning_service: Arc<WarningService>,
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
}

impl BrokerHealthMonitor {
    pub fn new(
        config: BrokerHealthConfig,
        probe: Arc<dyn BrokerProbe>,
        warning_service: Arc<WarningService>,
    ) -> Self {
        Self {
            config,
            probe,
            warning_service,
            consecutive_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub async fn check_once(&self) {
        match self.probe.probe().await {
            Ok(()) => {
                let failures = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if failures > 0 {
                    info!(previous_failures = failures, "Broker probe recovered");
                }
                self.healthy.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %e, consecutive_failures = failures, "Broker probe failed");

                if failures >= self.config.failure_threshold {
                    self.healthy.store(false, Ordering::SeqCst);

                    // Unknown failures carry an exception chain rather than
                    // a clean negative answer from the broker.
                    let severity = match e {
                        BrokerProbeError::Unknown(_) => WarningSeverity::Critical,
                        _ => WarningSeverity::Error,
                    };

                    self.warning_service.add_warning(
                        WarningCategory::BrokerHealth,
                        severity,
                        format!("Broker probe failed {failures} consecutive times: {e}"),
                        "BrokerHealthMonitor".to_string(),
                    );
                }
            }
        }
    }
}

pub fn spawn_broker_health_monitor(
    monitor: Arc<BrokerHealthMonitor>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let interval = monitor.config.check_interval;

    tokio::spawn(async move {
        if !monitor.config.enabled {
            return;
        }
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running broker health probe");
                    monitor.check_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Broker health monitor shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FlakyProbe {
        failures_before_success: AtomicUsize,
        kind: fn(String) -> BrokerProbeError,
    }

    #[async_trait]
    impl BrokerProbe for FlakyProbe {
        async fn probe(&self) -> Result<(), BrokerProbeError> {
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(());
            }
            self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
            Err((self.kind)("probe refused".to_string()))
        }
    }

    fn monitor_with(
        failures: usize,
        kind: fn(String) -> BrokerProbeError,
    ) -> (Arc<BrokerHealthMonitor>, Arc<WarningService>) {
        let warnings = Arc::new(WarningService::default());
        let monitor = Arc::new(BrokerHealthMonitor::new(
            BrokerHealthConfig {
                failure_threshold: 3,
                ..Default::default()
            },
            Arc::new(FlakyProbe {
                failures_before_success: AtomicUsize::new(failures),
                kind,
            }),
            warnings.clone(),
        ));
        (monitor, warnings)
    }

    #[tokio::test]
    async fn warning_after_threshold_failures() {
        let (monitor, warnings) = monitor_with(10, BrokerProbeError::Unreachable);

        monitor.check_once().await;
        monitor.check_once().await;
        assert_eq!(warnings.warning_count(), 0);
        assert!(monitor.is_healthy());

        monitor.check_once().await;
        assert_eq!(warnings.warning_count(), 1);
        assert!(!monitor.is_healthy());

        let warning = &warnings.get_all_warnings()[0];
        assert_eq!(warning.category, WarningCategory::BrokerHealth);
        assert_eq!(warning.severity, WarningSeverity::Error);
    }

    #[tokio::test]
    async fn unknown_errors_escalate_to_critical() {
        let (monitor, warnings) = monitor_with(10, BrokerProbeError::Unknown);

        for _ in 0..3 {
            monitor.check_once().await;
        }

        let warning = &warnings.get_all_warnings()[0];
        assert_eq!(warning.severity, WarningSeverity::Critical);
    }

    #[tokio::test]
    async fn recovery_resets_counter() {
        let (monitor, _warnings) = monitor_with(2, BrokerProbeError::Unreachable);

        monitor.check_once().await;
        monitor.check_once().await;
        assert_eq!(monitor.consecutive_failures(), 2);

        monitor.check_once().await; // succeeds
        assert_eq!(monitor.consecutive_failures(), 0);
        assert!(monitor.is_healthy());
    }
}
