//! Relaypoint message router.
//!
//! - `QueueManager` binds broker consumers to processing pools and drives
//!   their lifecycle.
//! - `ProcessPool` enforces concurrency and rate limits with strict FIFO
//!   per message group.
//! - `HttpMediator` delivers pointers over signed HTTP with retries and a
//!   per-endpoint circuit breaker.
//! - `WarningService` / `HealthService` carry the operational surface.
//! - `TrafficManager` handles PRIMARY/STANDBY transitions.
//! - `api` exposes the monitoring and publishing HTTP surface.

pub mod api;
pub mod breaker;
pub mod broker_health;
pub mod config_sync;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod mediator;
pub mod pool;
pub mod queue_health;
pub mod signature;
pub mod stats;
pub mod traffic;
pub mod warning;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
pub use broker_health::{BrokerHealthConfig, BrokerHealthMonitor};
pub use config_sync::{ConfigSyncConfig, ConfigSyncService};
pub use error::RouterError;
pub use health::{HealthService, HealthServiceConfig};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use manager::{ConsumerFactory, InFlightMessageInfo, QueueManager, QueueManagerConfig};
pub use mediator::{HttpMediator, HttpMediatorConfig, Mediator};
pub use pool::ProcessPool;
pub use queue_health::{QueueHealthConfig, QueueHealthMonitor};
pub use stats::PoolStatsCollector;
pub use traffic::{
    NoopTrafficStrategy, TrafficError, TrafficListener, TrafficManager, TrafficRole,
    TrafficStrategy,
};
pub use warning::{WarningService, WarningServiceConfig};

pub type Result<T> = std::result::Result<T, RouterError>;
