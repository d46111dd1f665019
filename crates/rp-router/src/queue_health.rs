//! Queue depth monitoring: backlog and sustained-growth warnings.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::warning::WarningService;
use rp_common::{WarningCategory, WarningSeverity};
use rp_queue::QueueMetrics;

#[derive(Debug, Clone)]
pub struct QueueHealthConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    /// Depth above which QUEUE_BACKLOG fires.
    pub backlog_threshold: u64,
    /// Per-period growth at or above which a growth period is counted.
    pub growth_threshold: u64,
    /// Consecutive growth periods before QUEUE_GROWING fires.
    pub growth_periods_threshold: u32,
}

impl Default for QueueHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            backlog_threshold: 1000,
            growth_threshold: 100,
            growth_periods_threshold: 3,
        }
    }
}

#[derive(Default)]
struct DepthHistory {
    last_depth: Option<u64>,
    consecutive_growth_periods: u32,
}

/// The growth streak saturates here so a long-running growth trend does
/// not spam a warning every period counter value.
const GROWTH_STREAK_CAP: u32 = 10;

pub struct QueueHealthMonitor {
    config: QueueHealthConfig,
    warning_service: Arc<WarningService>,
    history: Mutex<HashMap<String, DepthHistory>>,
}

impl QueueHealthMonitor {
    pub fn new(config: QueueHealthConfig, warning_service: Arc<WarningService>) -> Self {
        Self {
            config,
            warning_service,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueueHealthConfig {
        &self.config
    }

    pub fn check_queue_health(&self, metrics: &[QueueMetrics]) {
        if !self.config.enabled {
            return;
        }
        for m in metrics {
            self.check_backlog(&m.queue_identifier, m.pending_messages);
            self.check_growth(&m.queue_identifier, m.pending_messages);
        }
    }

    fn check_backlog(&self, queue: &str, depth: u64) {
        if depth > self.config.backlog_threshold {
            warn!(
                queue = %queue,
                depth = depth,
                threshold = self.config.backlog_threshold,
                "Queue backlog detected"
            );
            self.warning_service.add_warning(
                WarningCategory::QueueBacklog,
                WarningSeverity::Warning,
                format!(
                    "Queue {queue} depth {depth} exceeds threshold {}",
                    self.config.backlog_threshold
                ),
                "QueueHealthMonitor".to_string(),
            );
        }
    }

    fn check_growth(&self, queue: &str, depth: u64) {
        let mut history = self.history.lock();
        let entry = history.entry(queue.to_string()).or_default();

        if let Some(previous) = entry.last_depth {
            let growth = depth.saturating_sub(previous);

            if depth > previous && growth >= self.config.growth_threshold {
                entry.consecutive_growth_periods =
                    (entry.consecutive_growth_periods + 1).min(GROWTH_STREAK_CAP);

                if entry.consecutive_growth_periods >= self.config.growth_periods_threshold {
                    warn!(
                        queue = %queue,
                        periods = entry.consecutive_growth_periods,
                        depth = depth,
                        growth = growth,
                        "Sustained queue growth detected"
                    );
                    self.warning_service.add_warning(
                        WarningCategory::QueueGrowing,
                        WarningSeverity::Warning,
                        format!(
                            "Queue {queue} growing for {} periods (depth {depth}, +{growth}/{}s)",
                            entry.consecutive_growth_periods,
                            self.config.check_interval.as_secs()
                        ),
                        "QueueHealthMonitor".to_string(),
                    );
                }
            } else {
                if entry.consecutive_growth_periods > 0 {
                    debug!(queue = %queue, "Queue growth streak reset");
                }
                entry.consecutive_growth_periods = 0;
            }
        }

        entry.last_depth = Some(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(backlog: u64, growth: u64, periods: u32) -> (QueueHealthMonitor, Arc<WarningService>) {
        let warnings = Arc::new(WarningService::default());
        let monitor = QueueHealthMonitor::new(
            QueueHealthConfig {
                backlog_threshold: backlog,
                growth_threshold: growth,
                growth_periods_threshold: periods,
                ..Default::default()
            },
            warnings.clone(),
        );
        (monitor, warnings)
    }

    #[test]
    fn backlog_threshold_fires() {
        let (monitor, warnings) = monitor(100, 50, 3);

        monitor.check_backlog("q", 100);
        assert_eq!(warnings.warning_count(), 0);

        monitor.check_backlog("q", 101);
        assert_eq!(warnings.warning_count(), 1);
    }

    #[test]
    fn growth_needs_consecutive_periods() {
        let (monitor, warnings) = monitor(1_000_000, 50, 3);

        monitor.check_growth("q", 100); // baseline
        monitor.check_growth("q", 200); // period 1
        monitor.check_growth("q", 300); // period 2
        assert_eq!(warnings.warning_count(), 0);

        monitor.check_growth("q", 400); // period 3
        assert_eq!(warnings.warning_count(), 1);
    }

    #[test]
    fn growth_streak_resets_below_threshold() {
        let (monitor, warnings) = monitor(1_000_000, 50, 3);

        monitor.check_growth("q", 100);
        monitor.check_growth("q", 200);
        monitor.check_growth("q", 300);
        monitor.check_growth("q", 310); // growth 10 < 50, streak reset
        monitor.check_growth("q", 400);
        monitor.check_growth("q", 500);
        assert_eq!(warnings.warning_count(), 0);
    }

    #[test]
    fn growth_streak_saturates() {
        let (monitor, _warnings) = monitor(1_000_000, 50, 3);

        let mut depth = 100;
        for _ in 0..20 {
            monitor.check_growth("q", depth);
            depth += 100;
        }

        let history = monitor.history.lock();
        assert_eq!(history.get("q").unwrap().consecutive_growth_periods, GROWTH_STREAK_CAP);
    }
}
