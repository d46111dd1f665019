//! In-memory warning store.
//!
//! Warnings carry a category from the operational catalog and a severity.
//! Operators acknowledge them through the monitoring API; housekeeping
//! auto-acknowledges and expires old ones.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use rp_common::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    /// Warnings older than this are dropped by cleanup.
    pub max_warning_age_hours: i64,
    pub max_warnings: usize,
    /// Unacknowledged warnings older than this are auto-acknowledged.
    pub auto_acknowledge_hours: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warning_age_hours: 24,
            max_warnings: 1000,
            auto_acknowledge_hours: 8,
        }
    }
}

pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn add_warning(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> String {
        let warning = Warning::new(category, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            Self::evict_oldest(&mut warnings);
        }

        debug!(id = %id, category = ?category, severity = ?severity, "Warning raised");
        warnings.insert(id.clone(), warning);
        id
    }

    pub fn get_all_warnings(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn get_warnings_by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == severity)
            .cloned()
            .collect()
    }

    pub fn get_warnings_by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.category == category)
            .cloned()
            .collect()
    }

    pub fn get_unacknowledged_warnings(&self) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .cloned()
            .collect()
    }

    /// Unacknowledged warnings no older than `max_age_minutes`.
    pub fn get_active_warnings(&self, max_age_minutes: i64) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged && w.age_minutes() <= max_age_minutes)
            .cloned()
            .collect()
    }

    pub fn acknowledge_warning(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        match warnings.get_mut(id) {
            Some(warning) => {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn acknowledge_all(&self) -> usize {
        let mut warnings = self.warnings.write();
        let now = Utc::now();
        let mut count = 0;
        for warning in warnings.values_mut().filter(|w| !w.acknowledged) {
            warning.acknowledged = true;
            warning.acknowledged_at = Some(now);
            count += 1;
        }
        count
    }

    pub fn clear_all(&self) -> usize {
        let mut warnings = self.warnings.write();
        let count = warnings.len();
        warnings.clear();
        count
    }

    pub fn clear_old_warnings(&self, hours_old: i64) -> usize {
        let mut warnings = self.warnings.write();
        let threshold_minutes = hours_old * 60;
        let before = warnings.len();
        warnings.retain(|_, w| w.age_minutes() <= threshold_minutes);
        let removed = before - warnings.len();
        if removed > 0 {
            info!(removed = removed, "Cleared old warnings");
        }
        removed
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings.read().values().filter(|w| !w.acknowledged).count()
    }

    pub fn critical_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
            .count()
    }

    pub fn has_critical_warnings(&self) -> bool {
        self.critical_count() > 0
    }

    /// Periodic housekeeping: auto-acknowledge stale warnings, drop expired
    /// ones.
    pub fn cleanup(&self) {
        let threshold_minutes = self.config.auto_acknowledge_hours * 60;
        {
            let mut warnings = self.warnings.write();
            let now = Utc::now();
            for warning in warnings.values_mut() {
                if !warning.acknowledged && warning.age_minutes() > threshold_minutes {
                    warning.acknowledged = true;
                    warning.acknowledged_at = Some(now);
                }
            }
        }
        self.clear_old_warnings(self.config.max_warning_age_hours);
    }

    fn evict_oldest(warnings: &mut HashMap<String, Warning>) {
        // Drop the oldest 10% when at capacity
        let to_remove = (warnings.len() / 10).max(1);
        let mut by_age: Vec<_> = warnings
            .iter()
            .map(|(id, w)| (id.clone(), w.created_at))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);

        for (id, _) in by_age.into_iter().take(to_remove) {
            warnings.remove(&id);
        }
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_list() {
        let service = WarningService::default();
        let id = service.add_warning(
            WarningCategory::Mediation,
            WarningSeverity::Error,
            "delivery failed".to_string(),
            "test".to_string(),
        );

        let warnings = service.get_all_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].id, id);
    }

    #[test]
    fn acknowledge() {
        let service = WarningService::default();
        let id = service.add_warning(
            WarningCategory::QueueBacklog,
            WarningSeverity::Warning,
            "backlog".to_string(),
            "test".to_string(),
        );

        assert_eq!(service.unacknowledged_count(), 1);
        assert!(service.acknowledge_warning(&id));
        assert_eq!(service.unacknowledged_count(), 0);
        assert!(!service.acknowledge_warning("missing"));
    }

    #[test]
    fn severity_filter_and_critical_count() {
        let service = WarningService::default();
        service.add_warning(
            WarningCategory::BrokerHealth,
            WarningSeverity::Error,
            "probe failed".to_string(),
            "test".to_string(),
        );
        service.add_warning(
            WarningCategory::BrokerHealth,
            WarningSeverity::Critical,
            "broker down".to_string(),
            "test".to_string(),
        );

        assert_eq!(service.get_warnings_by_severity(WarningSeverity::Critical).len(), 1);
        assert!(service.has_critical_warnings());
    }

    #[test]
    fn capacity_eviction_keeps_newest() {
        let service = WarningService::new(WarningServiceConfig {
            max_warnings: 10,
            ..Default::default()
        });

        for i in 0..15 {
            service.add_warning(
                WarningCategory::Routing,
                WarningSeverity::Info,
                format!("warning {i}"),
                "test".to_string(),
            );
        }

        assert!(service.warning_count() <= 10 + 1);
    }
}
