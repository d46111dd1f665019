//! Bucketed rolling statistics for processing pools.
//!
//! Counts land in 10-second buckets; window queries sum the buckets that
//! fall inside the window instead of rescanning per-call samples. Two
//! windows are reported: 5 minutes and 30 minutes.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rp_common::WindowStats;

const BUCKET_SECS: u64 = 10;
const SHORT_WINDOW_SECS: u64 = 300;
const LONG_WINDOW_SECS: u64 = 1800;
const MAX_BUCKETS: usize = (LONG_WINDOW_SECS / BUCKET_SECS) as usize + 1;

#[derive(Debug, Default, Clone)]
struct Bucket {
    index: u64,
    processed: u64,
    succeeded: u64,
    failed: u64,
    rate_limited: u64,
    duration_sum_ms: u64,
    duration_count: u64,
}

pub struct PoolStatsCollector {
    epoch: Instant,
    total_processed: AtomicU64,
    total_succeeded: AtomicU64,
    total_failed: AtomicU64,
    total_rate_limited: AtomicU64,
    buckets: Mutex<VecDeque<Bucket>>,
}

impl PoolStatsCollector {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            total_processed: AtomicU64::new(0),
            total_succeeded: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_rate_limited: AtomicU64::new(0),
            buckets: Mutex::new(VecDeque::with_capacity(MAX_BUCKETS)),
        }
    }

    fn current_index(&self) -> u64 {
        self.epoch.elapsed().as_secs() / BUCKET_SECS
    }

    fn with_current_bucket(&self, f: impl FnOnce(&mut Bucket)) {
        let index = self.current_index();
        let mut buckets = self.buckets.lock();

        let needs_new = buckets.back().map(|b| b.index != index).unwrap_or(true);
        if needs_new {
            buckets.push_back(Bucket {
                index,
                ..Default::default()
            });
            let cutoff = index.saturating_sub(MAX_BUCKETS as u64);
            while buckets.front().map(|b| b.index < cutoff).unwrap_or(false) {
                buckets.pop_front();
            }
        }

        f(buckets.back_mut().expect("bucket pushed above"));
    }

    pub fn record_success(&self, duration_ms: u64) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.total_succeeded.fetch_add(1, Ordering::Relaxed);
        self.with_current_bucket(|b| {
            b.processed += 1;
            b.succeeded += 1;
            b.duration_sum_ms += duration_ms;
            b.duration_count += 1;
        });
    }

    pub fn record_failure(&self, duration_ms: u64) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.with_current_bucket(|b| {
            b.processed += 1;
            b.failed += 1;
            b.duration_sum_ms += duration_ms;
            b.duration_count += 1;
        });
    }

    /// A deferral counts as processed work but neither success nor failure.
    pub fn record_deferred(&self, duration_ms: u64) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.with_current_bucket(|b| {
            b.processed += 1;
            b.duration_sum_ms += duration_ms;
            b.duration_count += 1;
        });
    }

    pub fn record_rate_limited(&self) {
        self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
        self.with_current_bucket(|b| b.rate_limited += 1);
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }

    pub fn total_succeeded(&self) -> u64 {
        self.total_succeeded.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    pub fn total_rate_limited(&self) -> u64 {
        self.total_rate_limited.load(Ordering::Relaxed)
    }

    fn window(&self, window_secs: u64) -> WindowStats {
        let current = self.current_index();
        let span_buckets = window_secs / BUCKET_SECS;
        let cutoff = current.saturating_sub(span_buckets.saturating_sub(1));

        let buckets = self.buckets.lock();
        let mut stats = WindowStats {
            window_seconds: window_secs,
            ..Default::default()
        };
        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;

        for bucket in buckets.iter().filter(|b| b.index >= cutoff) {
            stats.processed += bucket.processed;
            stats.succeeded += bucket.succeeded;
            stats.failed += bucket.failed;
            stats.rate_limited += bucket.rate_limited;
            duration_sum += bucket.duration_sum_ms;
            duration_count += bucket.duration_count;
        }

        if duration_count > 0 {
            stats.avg_processing_ms = duration_sum as f64 / duration_count as f64;
        }
        if window_secs > 0 {
            stats.throughput_per_sec = stats.processed as f64 / window_secs as f64;
        }

        stats
    }

    pub fn last_5_min(&self) -> WindowStats {
        self.window(SHORT_WINDOW_SECS)
    }

    pub fn last_30_min(&self) -> WindowStats {
        self.window(LONG_WINDOW_SECS)
    }

    pub fn reset(&self) {
        self.total_processed.store(0, Ordering::Relaxed);
        self.total_succeeded.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.total_rate_limited.store(0, Ordering::Relaxed);
        self.buckets.lock().clear();
    }
}

impl Default for PoolStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collector() {
        let stats = PoolStatsCollector::new();
        let window = stats.last_5_min();
        assert_eq!(window.processed, 0);
        assert_eq!(window.avg_processing_ms, 0.0);
    }

    #[test]
    fn counts_and_average() {
        let stats = PoolStatsCollector::new();
        stats.record_success(100);
        stats.record_success(300);
        stats.record_failure(200);
        stats.record_deferred(400);
        stats.record_rate_limited();

        assert_eq!(stats.total_processed(), 4);
        assert_eq!(stats.total_succeeded(), 2);
        assert_eq!(stats.total_failed(), 1);
        assert_eq!(stats.total_rate_limited(), 1);

        let window = stats.last_5_min();
        assert_eq!(window.processed, 4);
        assert_eq!(window.succeeded, 2);
        assert_eq!(window.failed, 1);
        assert_eq!(window.rate_limited, 1);
        assert!((window.avg_processing_ms - 250.0).abs() < f64::EPSILON);
    }

    #[test]
    fn long_window_includes_short_window() {
        let stats = PoolStatsCollector::new();
        for _ in 0..10 {
            stats.record_success(50);
        }
        assert_eq!(stats.last_5_min().processed, 10);
        assert_eq!(stats.last_30_min().processed, 10);
    }

    #[test]
    fn reset_clears_everything() {
        let stats = PoolStatsCollector::new();
        stats.record_success(10);
        stats.reset();
        assert_eq!(stats.total_processed(), 0);
        assert_eq!(stats.last_30_min().processed, 0);
    }
}
