//! Sliding-window circuit breakers, one per mediation endpoint.
//!
//! State is a function of the ring buffer and elapsed time alone. The trip
//! check runs after every recorded call, success or failure, so a window
//! sitting exactly at the threshold rate opens on the call that reaches
//! `minimum_calls`. The OPEN → HALF_OPEN transition is evaluated lazily on
//! every call attempt and on every state query.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Opens when window failure rate reaches this value (`>=` comparison).
    pub failure_rate_threshold: f64,
    /// No trip evaluation until the window holds this many calls.
    pub minimum_calls: u32,
    /// Time in OPEN before the next attempt probes HALF_OPEN.
    pub wait_duration: Duration,
    /// Consecutive successes in HALF_OPEN required to close.
    pub permitted_calls_in_half_open: u32,
    pub sliding_window_size: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_calls: 10,
            wait_duration: Duration::from_secs(30),
            permitted_calls_in_half_open: 5,
            sliding_window_size: 100,
        }
    }
}

/// Snapshot for the monitoring API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    #[serde(rename = "successfulCalls")]
    pub successful_calls: u64,
    #[serde(rename = "failedCalls")]
    pub failed_calls: u64,
    #[serde(rename = "rejectedCalls")]
    pub rejected_calls: u64,
    #[serde(rename = "failureRate")]
    pub failure_rate: f64,
    #[serde(rename = "bufferedCalls")]
    pub buffered_calls: u32,
    #[serde(rename = "bufferSize")]
    pub buffer_size: u32,
}

/// Mutable core guarded by one short lock. `window` holds per-call success
/// flags, newest at the back, capped at the sliding window size.
struct BreakerCore {
    state: CircuitState,
    window: VecDeque<bool>,
    half_open_successes: u32,
    last_transition: Instant,
}

impl BreakerCore {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                half_open_successes: 0,
                last_transition: Instant::now(),
            }),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// OPEN lapses into HALF_OPEN once the wait duration has elapsed.
    fn refresh(&self, core: &mut BreakerCore) {
        if core.state == CircuitState::Open
            && core.last_transition.elapsed() >= self.config.wait_duration
        {
            core.state = CircuitState::HalfOpen;
            core.half_open_successes = 0;
            core.last_transition = Instant::now();
            debug!(breaker = %self.name, "Circuit half-open, probing");
        }
    }

    fn record(&self, core: &mut BreakerCore, success: bool) {
        if core.window.len() >= self.config.sliding_window_size as usize {
            core.window.pop_front();
        }
        core.window.push_back(success);
    }

    fn evaluate_trip(&self, core: &mut BreakerCore) {
        if core.state != CircuitState::Closed {
            return;
        }
        if core.window.len() >= self.config.minimum_calls as usize
            && core.failure_rate() >= self.config.failure_rate_threshold
        {
            core.state = CircuitState::Open;
            core.last_transition = Instant::now();
            warn!(
                breaker = %self.name,
                failure_rate = core.failure_rate(),
                "Circuit opened"
            );
        }
    }

    /// Gate a call. A `false` return means the call was rejected without
    /// being attempted.
    pub fn try_acquire(&self) -> bool {
        let mut core = self.core.lock();
        self.refresh(&mut core);

        if core.state == CircuitState::Open {
            drop(core);
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);

        let mut core = self.core.lock();
        self.refresh(&mut core);
        self.record(&mut core, true);

        match core.state {
            CircuitState::HalfOpen => {
                core.half_open_successes += 1;
                if core.half_open_successes >= self.config.permitted_calls_in_half_open {
                    core.state = CircuitState::Closed;
                    core.window.clear();
                    core.last_transition = Instant::now();
                    info!(breaker = %self.name, "Circuit closed");
                }
            }
            _ => self.evaluate_trip(&mut core),
        }
    }

    pub fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);

        let mut core = self.core.lock();
        self.refresh(&mut core);
        self.record(&mut core, false);

        match core.state {
            CircuitState::HalfOpen => {
                core.state = CircuitState::Open;
                core.last_transition = Instant::now();
                warn!(breaker = %self.name, "Circuit re-opened from half-open");
            }
            _ => self.evaluate_trip(&mut core),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut core = self.core.lock();
        self.refresh(&mut core);
        core.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut core = self.core.lock();
        self.refresh(&mut core);

        CircuitBreakerStats {
            name: self.name.clone(),
            state: core.state,
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            failure_rate: core.failure_rate(),
            buffered_calls: core.window.len() as u32,
            buffer_size: self.config.sliding_window_size,
        }
    }

    /// Force CLOSED and clear the window. Monotonic counters are kept.
    pub fn reset(&self) {
        let mut core = self.core.lock();
        core.state = CircuitState::Closed;
        core.window.clear();
        core.half_open_successes = 0;
        core.last_transition = Instant::now();
    }
}

/// Per-endpoint circuit breaker registry.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn get_or_create(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(endpoint) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(endpoint.to_string())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(endpoint.to_string(), self.config.clone()))
                }),
        )
    }

    pub fn try_acquire(&self, endpoint: &str) -> bool {
        self.get_or_create(endpoint).try_acquire()
    }

    pub fn record_success(&self, endpoint: &str) {
        self.get_or_create(endpoint).record_success();
    }

    pub fn record_failure(&self, endpoint: &str) {
        self.get_or_create(endpoint).record_failure();
    }

    pub fn get_state(&self, endpoint: &str) -> Option<CircuitState> {
        self.breakers.read().get(endpoint).map(|b| b.state())
    }

    pub fn get_stats(&self, endpoint: &str) -> Option<CircuitBreakerStats> {
        self.breakers.read().get(endpoint).map(|b| b.stats())
    }

    pub fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.stats()))
            .collect()
    }

    pub fn reset(&self, endpoint: &str) -> bool {
        match self.breakers.read().get(endpoint) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| b.state() == CircuitState::Open)
            .count()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: 0.5,
            minimum_calls: 10,
            wait_duration: Duration::from_millis(50),
            permitted_calls_in_half_open: 3,
            sliding_window_size: 100,
        }
    }

    #[test]
    fn trips_at_threshold_rate_on_minimum_calls() {
        let breaker = CircuitBreaker::new("t".into(), test_config());

        for _ in 0..5 {
            breaker.record_failure();
        }
        for _ in 0..4 {
            breaker.record_success();
        }
        // Nine calls: below minimum, still closed even at rate > threshold
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Tenth call brings the window to minimum_calls with rate exactly
        // at the threshold; >= comparison opens the circuit.
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn half_open_probe_then_close() {
        let breaker = CircuitBreaker::new("t".into(), test_config());

        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));

        // Next attempt transitions to half-open before being evaluated
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Window cleared on close
        assert_eq!(breaker.stats().buffered_calls, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("t".into(), test_config());

        for _ in 0..10 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn rejections_are_counted_without_calls() {
        let breaker = CircuitBreaker::new("t".into(), CircuitBreakerConfig {
            wait_duration: Duration::from_secs(3600),
            ..test_config()
        });

        for _ in 0..10 {
            breaker.record_failure();
        }
        assert!(!breaker.try_acquire());
        assert!(!breaker.try_acquire());

        let stats = breaker.stats();
        assert_eq!(stats.rejected_calls, 2);
        assert_eq!(stats.failed_calls, 10);
    }

    #[test]
    fn empty_window_has_zero_failure_rate() {
        let breaker = CircuitBreaker::new("t".into(), test_config());
        assert_eq!(breaker.stats().failure_rate, 0.0);
    }

    #[test]
    fn registry_reset_closes_breaker() {
        let registry = CircuitBreakerRegistry::new(test_config());
        let endpoint = "http://example.com/hook";

        for _ in 0..10 {
            registry.record_failure(endpoint);
        }
        assert_eq!(registry.get_state(endpoint), Some(CircuitState::Open));
        assert_eq!(registry.open_count(), 1);

        assert!(registry.reset(endpoint));
        assert_eq!(registry.get_state(endpoint), Some(CircuitState::Closed));
        assert!(!registry.reset("http://unknown"));
    }
}
