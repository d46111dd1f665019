//! Queue manager reconciliation and bookkeeping.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use rp_common::{
    MediationOutcome, MessagePointer, PoolConfig, QueuedMessage, RouterTopology, WarningCategory,
};
use rp_queue::QueueConsumer;
use rp_router::{
    Mediator, QueueManager, QueueManagerConfig, WarningService, WarningServiceConfig,
};

struct NoopMediator;

#[async_trait]
impl Mediator for NoopMediator {
    async fn mediate(&self, _pointer: &MessagePointer, _target: &str) -> MediationOutcome {
        MediationOutcome::success()
    }
}

struct SilentConsumer {
    identifier: String,
}

#[async_trait]
impl QueueConsumer for SilentConsumer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn poll(&self, _max: u32) -> rp_queue::Result<Vec<QueuedMessage>> {
        Ok(vec![])
    }

    async fn ack(&self, _receipt_handle: &str) -> rp_queue::Result<()> {
        Ok(())
    }

    async fn nack(&self, _receipt_handle: &str, _delay: Option<u32>) -> rp_queue::Result<()> {
        Ok(())
    }

    async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> rp_queue::Result<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn stop(&self) {}
}

fn pool(code: &str, concurrency: u32, rate_limit: Option<u32>) -> PoolConfig {
    PoolConfig {
        code: code.to_string(),
        concurrency,
        rate_limit_per_minute: rate_limit,
        callback_url: Some("http://localhost:9/hook".to_string()),
        timeout_ms: None,
        retries: None,
    }
}

fn topology(pools: Vec<PoolConfig>) -> RouterTopology {
    RouterTopology {
        processing_pools: pools,
        queues: vec![],
    }
}

#[tokio::test]
async fn reload_updates_creates_and_drains_pools() {
    let manager = Arc::new(QueueManager::new(Arc::new(NoopMediator)));

    manager
        .apply_config(topology(vec![pool("A", 5, None), pool("B", 10, Some(100))]))
        .await
        .unwrap();
    assert_eq!(manager.pool_codes().len(), 2);

    // A resized, B removed, C created
    let summary = manager
        .reload_config(topology(vec![pool("A", 8, None), pool("C", 3, None)]))
        .await
        .unwrap();

    assert_eq!(summary.pools_updated, 1);
    assert_eq!(summary.pools_created, 1);
    assert_eq!(summary.pools_removed, 1);

    let mut codes = manager.pool_codes();
    codes.sort();
    assert_eq!(codes, vec!["A".to_string(), "C".to_string()]);

    let a = manager.get_pool("A").unwrap();
    assert_eq!(a.concurrency(), 8);

    // The removed pool drains rather than vanishing mid-flight
    manager.cleanup_draining_pools().await;
}

#[tokio::test]
async fn rate_limit_changes_apply_in_place() {
    let manager = Arc::new(QueueManager::new(Arc::new(NoopMediator)));
    manager
        .apply_config(topology(vec![pool("A", 5, Some(100))]))
        .await
        .unwrap();

    manager
        .reload_config(topology(vec![pool("A", 5, Some(200))]))
        .await
        .unwrap();

    let a = manager.get_pool("A").unwrap();
    assert_eq!(a.rate_limit_per_minute(), Some(200));

    // Clearing the limit disables it
    manager
        .reload_config(topology(vec![pool("A", 5, None)]))
        .await
        .unwrap();
    assert_eq!(manager.get_pool("A").unwrap().rate_limit_per_minute(), None);
}

#[tokio::test]
async fn pool_limit_raises_critical_warning() {
    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let manager = Arc::new(QueueManager::with_config(
        Arc::new(NoopMediator),
        QueueManagerConfig {
            max_pools: 2,
            pool_warning_threshold: 1,
            drain_deadline: Duration::from_secs(1),
            drain_grace: Duration::from_secs(1),
        },
    ));
    manager.set_warning_service(warnings.clone());

    manager
        .apply_config(topology(vec![pool("A", 1, None), pool("B", 1, None)]))
        .await
        .unwrap();

    // Third pool exceeds the budget and is refused
    manager
        .reload_config(topology(vec![pool("A", 1, None), pool("B", 1, None), pool("C", 1, None)]))
        .await
        .unwrap();

    assert_eq!(manager.pool_codes().len(), 2);
    let pool_limit_warnings = warnings.get_warnings_by_category(WarningCategory::PoolLimit);
    assert!(!pool_limit_warnings.is_empty());
}

#[tokio::test]
async fn consumer_registration_and_health_lookup() {
    let manager = Arc::new(QueueManager::new(Arc::new(NoopMediator)));
    manager
        .add_consumer(Arc::new(SilentConsumer {
            identifier: "q-1".to_string(),
        }))
        .await;

    assert_eq!(manager.consumer_ids().await, vec!["q-1".to_string()]);
    assert!(manager.is_consumer_healthy("q-1").await);
    assert!(!manager.is_consumer_healthy("missing").await);
}

#[tokio::test]
async fn shutdown_with_nothing_in_flight_is_clean() {
    let manager = Arc::new(QueueManager::with_config(
        Arc::new(NoopMediator),
        QueueManagerConfig {
            drain_deadline: Duration::from_secs(1),
            drain_grace: Duration::from_secs(1),
            ..Default::default()
        },
    ));
    manager
        .apply_config(topology(vec![pool("A", 2, None)]))
        .await
        .unwrap();

    assert!(manager.shutdown().await, "empty drain must be clean");
    assert!(!manager.is_running());
}

#[tokio::test]
async fn pause_and_resume_toggle_polling() {
    let manager = Arc::new(QueueManager::new(Arc::new(NoopMediator)));
    assert!(!manager.is_paused());
    manager.pause();
    assert!(manager.is_paused());
    manager.resume();
    assert!(!manager.is_paused());
}
