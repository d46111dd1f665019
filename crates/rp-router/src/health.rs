//! Aggregate health: rolling pool success rates, consumer staleness, and
//! the overall report served by the probes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::warning::WarningService;
use rp_common::{ConsumerHealth, HealthReport, HealthStatus, PoolStats};

#[derive(Debug, Clone)]
pub struct HealthServiceConfig {
    /// Pool success rate at or above this is healthy.
    pub healthy_threshold: f64,
    pub rolling_window: Duration,
    /// Warnings older than this no longer count against health.
    pub warning_age_minutes: i64,
    /// Seconds since last poll before a consumer counts as stalled.
    pub consumer_stall_threshold_secs: u64,
}

impl Default for HealthServiceConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 0.90,
            rolling_window: Duration::from_secs(30 * 60),
            warning_age_minutes: 30,
            consumer_stall_threshold_secs: 60,
        }
    }
}

/// Rolling success/failure window for one pool.
struct RollingCounter {
    window: Duration,
    events: Vec<(Instant, bool)>,
}

impl RollingCounter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            events: Vec::new(),
        }
    }

    fn record(&mut self, success: bool) {
        let cutoff = Instant::now() - self.window;
        self.events.retain(|(t, _)| *t > cutoff);
        self.events.push((Instant::now(), success));
    }

    fn success_rate(&self) -> Option<f64> {
        let cutoff = Instant::now() - self.window;
        let recent: Vec<_> = self.events.iter().filter(|(t, _)| *t > cutoff).collect();
        if recent.is_empty() {
            return None;
        }
        let successes = recent.iter().filter(|(_, ok)| *ok).count();
        Some(successes as f64 / recent.len() as f64)
    }
}

pub struct HealthService {
    config: HealthServiceConfig,
    warning_service: Arc<WarningService>,
    pool_counters: RwLock<HashMap<String, RollingCounter>>,
    consumer_last_poll: RwLock<HashMap<String, Instant>>,
    consumer_running: RwLock<HashMap<String, bool>>,
}

impl HealthService {
    pub fn new(config: HealthServiceConfig, warning_service: Arc<WarningService>) -> Self {
        Self {
            config,
            warning_service,
            pool_counters: RwLock::new(HashMap::new()),
            consumer_last_poll: RwLock::new(HashMap::new()),
            consumer_running: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_pool_result(&self, pool_code: &str, success: bool) {
        let mut counters = self.pool_counters.write();
        counters
            .entry(pool_code.to_string())
            .or_insert_with(|| RollingCounter::new(self.config.rolling_window))
            .record(success);
    }

    pub fn get_pool_success_rate(&self, pool_code: &str) -> Option<f64> {
        self.pool_counters
            .read()
            .get(pool_code)
            .and_then(|c| c.success_rate())
    }

    pub fn record_consumer_poll(&self, consumer_id: &str) {
        self.consumer_last_poll
            .write()
            .insert(consumer_id.to_string(), Instant::now());
    }

    pub fn set_consumer_running(&self, consumer_id: &str, running: bool) {
        self.consumer_running
            .write()
            .insert(consumer_id.to_string(), running);
    }

    pub fn is_consumer_healthy(&self, consumer_id: &str) -> bool {
        let running = self
            .consumer_running
            .read()
            .get(consumer_id)
            .copied()
            .unwrap_or(false);
        if !running {
            return false;
        }

        let threshold = Duration::from_secs(self.config.consumer_stall_threshold_secs);
        match self.consumer_last_poll.read().get(consumer_id) {
            // Not yet polled counts as healthy right after start
            None => true,
            Some(t) => t.elapsed() < threshold,
        }
    }

    pub fn get_consumer_health(&self, consumer_id: &str) -> ConsumerHealth {
        let running = self
            .consumer_running
            .read()
            .get(consumer_id)
            .copied()
            .unwrap_or(false);
        let since_poll = self
            .consumer_last_poll
            .read()
            .get(consumer_id)
            .map(|t| t.elapsed().as_millis() as i64);

        ConsumerHealth {
            queue_identifier: consumer_id.to_string(),
            is_healthy: self.is_consumer_healthy(consumer_id),
            is_running: running,
            time_since_last_poll_ms: since_poll,
        }
    }

    pub fn all_consumer_health(&self) -> Vec<ConsumerHealth> {
        let ids: Vec<String> = self.consumer_running.read().keys().cloned().collect();
        ids.iter().map(|id| self.get_consumer_health(id)).collect()
    }

    /// Running consumers that have polled but gone stale.
    pub fn get_stalled_consumers(&self) -> Vec<String> {
        let threshold = Duration::from_secs(self.config.consumer_stall_threshold_secs);
        let last_poll = self.consumer_last_poll.read();
        let running = self.consumer_running.read();

        running
            .iter()
            .filter(|(id, is_running)| {
                **is_running
                    && last_poll
                        .get(*id)
                        .map(|t| t.elapsed() >= threshold)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get_health_report(&self, pool_stats: &[PoolStats]) -> HealthReport {
        let mut issues = Vec::new();

        let mut pools_healthy = 0u32;
        let mut pools_unhealthy = 0u32;
        for stat in pool_stats {
            match self.get_pool_success_rate(&stat.pool_code) {
                Some(rate) if rate < self.config.healthy_threshold => {
                    pools_unhealthy += 1;
                    issues.push(format!(
                        "pool {} success rate {:.1}%",
                        stat.pool_code,
                        rate * 100.0
                    ));
                }
                // No samples yet counts as healthy
                _ => pools_healthy += 1,
            }
        }

        let consumers_total = self.consumer_running.read().len() as u32;
        let stalled = self.get_stalled_consumers();
        let consumers_unhealthy = stalled.len() as u32;
        let consumers_healthy = consumers_total.saturating_sub(consumers_unhealthy);
        for consumer_id in &stalled {
            issues.push(format!("consumer {consumer_id} is stalled"));
        }

        let active_warnings = self
            .warning_service
            .get_active_warnings(self.config.warning_age_minutes)
            .len() as u32;
        let critical_warnings = self.warning_service.critical_count() as u32;
        if critical_warnings > 0 {
            issues.push(format!("{critical_warnings} critical warnings"));
        }

        let status = if critical_warnings > 0
            || (pools_unhealthy > 0 && pools_healthy == 0)
            || (consumers_unhealthy > 0 && consumers_healthy == 0 && consumers_total > 0)
        {
            HealthStatus::Degraded
        } else if pools_unhealthy > 0 || consumers_unhealthy > 0 || active_warnings > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            pools_healthy,
            pools_unhealthy,
            consumers_healthy,
            consumers_unhealthy,
            active_warnings,
            critical_warnings,
            issues,
        }
    }

    pub fn is_healthy(&self, pool_stats: &[PoolStats]) -> bool {
        self.get_health_report(pool_stats).status == HealthStatus::Healthy
    }

    pub fn cleanup(&self) {
        self.warning_service.cleanup();

        let stalled = self.get_stalled_consumers();
        if !stalled.is_empty() {
            warn!(count = stalled.len(), consumers = ?stalled, "Stalled consumers detected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_common::WindowStats;

    fn service() -> HealthService {
        HealthService::new(
            HealthServiceConfig::default(),
            Arc::new(WarningService::default()),
        )
    }

    fn pool_stats(code: &str) -> PoolStats {
        PoolStats {
            pool_code: code.to_string(),
            concurrency: 10,
            active_workers: 0,
            available_permits: 10,
            queue_size: 0,
            queue_capacity: 50,
            message_group_count: 0,
            rate_limit_per_minute: None,
            is_rate_limited: false,
            total_processed: 0,
            total_succeeded: 0,
            total_failed: 0,
            total_rate_limited: 0,
            last_5_min: WindowStats::default(),
            last_30_min: WindowStats::default(),
        }
    }

    #[test]
    fn all_success_is_healthy() {
        let service = service();
        for _ in 0..10 {
            service.record_pool_result("A", true);
        }
        assert_eq!(service.get_pool_success_rate("A"), Some(1.0));

        let report = service.get_health_report(&[pool_stats("A")]);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn low_success_rate_degrades() {
        let service = service();
        for _ in 0..10 {
            service.record_pool_result("A", false);
        }

        let report = service.get_health_report(&[pool_stats("A")]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.pools_unhealthy, 1);
    }

    #[test]
    fn fresh_consumer_is_healthy_before_first_poll() {
        let service = service();
        service.set_consumer_running("q-1", true);
        assert!(service.is_consumer_healthy("q-1"));

        service.record_consumer_poll("q-1");
        assert!(service.is_consumer_healthy("q-1"));
    }

    #[test]
    fn stopped_consumer_is_unhealthy() {
        let service = service();
        service.set_consumer_running("q-1", false);
        assert!(!service.is_consumer_healthy("q-1"));
    }
}
