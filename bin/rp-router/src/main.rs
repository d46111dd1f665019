//! Relaypoint production router.
//!
//! Consumes from the configured broker (embedded, SQS, JetStream, or
//! AMQP), routes through the processing pools, and serves the monitoring
//! API. Exits 0 after a clean drain on SIGINT/SIGTERM and 1 when the
//! drain deadline elapses with work still in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use rp_common::{PoolConfig, QueueBinding, RouterTopology};
use rp_config::AppConfig;
use rp_queue::embedded::{EmbeddedQueueConfig, EmbeddedQueueEngine};
use rp_queue::{BrokerProbe, QueueConsumer, QueuePublisher};
use rp_router::api::{create_router, AppState};
use rp_router::{
    BrokerHealthConfig, BrokerHealthMonitor, CircuitBreakerConfig, CircuitBreakerRegistry,
    ConfigSyncConfig, ConfigSyncService, HealthService, HealthServiceConfig, HttpMediator,
    HttpMediatorConfig, LifecycleConfig, LifecycleManager, QueueHealthConfig, QueueHealthMonitor,
    QueueManager, QueueManagerConfig, TrafficListener, TrafficManager, WarningService,
    WarningServiceConfig,
};

struct BrokerSetup {
    consumers: Vec<Arc<dyn QueueConsumer + Send + Sync>>,
    publisher: Arc<dyn QueuePublisher>,
    probe: Arc<dyn BrokerProbe>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    rp_common::logging::init_logging("rp-router");

    match run().await {
        Ok(clean) => {
            if clean {
                info!("Router shutdown complete");
                std::process::exit(0);
            } else {
                warn!("Router shutdown with drain deadline elapsed");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!(error = %e, "Router failed to start");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<bool> {
    let config = AppConfig::load().context("configuration load failed")?;

    info!(
        queue_type = %config.queue.queue_type,
        dev_mode = config.dev_mode,
        "Starting Relaypoint router"
    );

    // Services
    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(
        HealthServiceConfig::default(),
        warning_service.clone(),
    ));

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_rate_threshold: config.router.circuit_breaker.failure_rate_threshold,
        minimum_calls: config.router.circuit_breaker.minimum_calls,
        wait_duration: Duration::from_millis(config.router.circuit_breaker.wait_duration_ms),
        permitted_calls_in_half_open: config.router.circuit_breaker.permitted_calls_in_half_open,
        sliding_window_size: config.router.circuit_breaker.sliding_window_size,
    }));

    let mediator = Arc::new(
        HttpMediator::new(
            HttpMediatorConfig {
                connect_timeout: Duration::from_millis(config.router.mediation.connect_timeout_ms),
                request_timeout: Duration::from_millis(config.router.mediation.request_timeout_ms),
                headers_timeout: Duration::from_millis(config.router.mediation.headers_timeout_ms),
                retries: config.router.mediation.retries,
                retry_delay: Duration::from_millis(config.router.mediation.retry_delay_ms),
            },
            breakers.clone(),
        )
        .with_warning_service(warning_service.clone()),
    );

    // Queue manager
    let manager = Arc::new(QueueManager::with_config(
        mediator,
        QueueManagerConfig {
            max_pools: config.router.max_pools,
            pool_warning_threshold: config.router.pool_warning_threshold,
            drain_deadline: Duration::from_secs(config.router.drain_deadline_seconds),
            drain_grace: Duration::from_secs(config.router.drain_grace_seconds),
        },
    ));
    manager.set_warning_service(warning_service.clone());
    manager.set_health_service(health_service.clone());

    // Broker
    let broker = build_broker(&config).await?;
    for consumer in &broker.consumers {
        manager.add_consumer(consumer.clone()).await;
    }

    // Topology: dev mode ships a built-in one; production fetches from the
    // config service.
    let config_sync = if config.dev_mode {
        let topology = dev_topology(&config);
        info!(
            pools = topology.processing_pools.len(),
            queues = topology.queues.len(),
            "Using built-in dev topology"
        );
        manager.apply_config(topology).await?;
        None
    } else if config.router.config_sync.enabled {
        let sync_service = Arc::new(ConfigSyncService::new(
            ConfigSyncConfig {
                enabled: true,
                config_url: config.router.config_sync.config_url.clone(),
                sync_interval: Duration::from_secs(config.router.config_sync.interval_seconds),
                max_retry_attempts: config.router.config_sync.max_retry_attempts,
                retry_delay: Duration::from_secs(config.router.config_sync.retry_delay_seconds),
                request_timeout: Duration::from_secs(config.router.config_sync.request_timeout_seconds),
                fail_on_initial_error: config.router.config_sync.fail_on_initial_error,
            },
            manager.clone(),
            warning_service.clone(),
        ));
        sync_service
            .initial_sync()
            .await
            .context("initial configuration sync failed")?;
        Some(sync_service)
    } else {
        bail!("no topology source: set DEV_MODE=true or CONFIG_SYNC_URL");
    };

    // Traffic manager: consumers pause on STANDBY, resume on PRIMARY
    let traffic = Arc::new(TrafficManager::with_noop_strategy());
    traffic.add_listener(manager.clone() as Arc<dyn TrafficListener>);

    // Optional Redis leader election drives the traffic role
    let standby_enabled = config.standby.enabled;
    let instance_id = if config.standby.instance_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.standby.instance_id.clone()
    };
    if standby_enabled {
        spawn_leader_election(&config, instance_id.clone(), traffic.clone()).await?;
    }

    // Monitors + lifecycle
    let queue_health = Arc::new(QueueHealthMonitor::new(
        QueueHealthConfig {
            enabled: config.router.queue_health.enabled,
            check_interval: Duration::from_secs(config.router.queue_health.check_interval_seconds),
            backlog_threshold: config.router.queue_health.backlog_threshold,
            growth_threshold: config.router.queue_health.growth_threshold,
            growth_periods_threshold: config.router.queue_health.growth_periods,
        },
        warning_service.clone(),
    ));

    let broker_health = Arc::new(BrokerHealthMonitor::new(
        BrokerHealthConfig {
            enabled: config.router.broker_health.enabled,
            check_interval: Duration::from_millis(config.router.broker_health.check_interval_ms),
            failure_threshold: config.router.broker_health.failure_threshold,
        },
        broker.probe.clone(),
        warning_service.clone(),
    ));

    let lifecycle = LifecycleManager::start_with_monitors(
        manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        LifecycleConfig::default(),
        Some(queue_health),
        Some(broker_health),
        config_sync,
    );

    // HTTP API
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok();
    if prometheus.is_none() {
        warn!("Prometheus recorder installation failed; /metrics disabled");
    }

    let state = AppState {
        publisher: broker.publisher.clone(),
        manager: manager.clone(),
        warning_service: warning_service.clone(),
        health_service: health_service.clone(),
        breakers: breakers.clone(),
        traffic: traffic.clone(),
        standby_enabled,
        instance_id,
        prometheus,
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind failed on {addr}"))?;
    info!(addr = %addr, "HTTP API listening");

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    });

    // Poll loops
    let manager_task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start().await {
                error!(error = %e, "Queue manager error");
            }
        })
    };

    info!("Relaypoint router started");

    shutdown_signal().await;
    info!("Shutdown signal received");

    lifecycle.shutdown();
    let clean = manager.shutdown().await;

    server_task.abort();
    let _ = tokio::time::timeout(Duration::from_secs(5), manager_task).await;

    Ok(clean)
}

async fn build_broker(config: &AppConfig) -> Result<BrokerSetup> {
    match config.queue.queue_type.as_str() {
        "embedded" => {
            let db_path = if config.queue.embedded.db_path.is_empty() {
                None
            } else {
                Some(config.queue.embedded.db_path.clone())
            };
            let engine = EmbeddedQueueEngine::open(EmbeddedQueueConfig {
                queue_name: "embedded".to_string(),
                db_path,
                visibility_timeout: Duration::from_secs(
                    config.queue.embedded.visibility_timeout_seconds as u64,
                ),
                dedup_window: Duration::from_secs(config.queue.embedded.dedup_window_seconds),
                checkpoint_interval: Duration::from_secs(
                    config.queue.embedded.checkpoint_interval_seconds,
                ),
            })
            .await?;

            Ok(BrokerSetup {
                consumers: vec![engine.clone() as Arc<dyn QueueConsumer + Send + Sync>],
                publisher: engine.clone(),
                probe: engine,
            })
        }
        "sqs" => {
            if config.queue.sqs.queue_url.is_empty() {
                bail!("SQS_QUEUE_URL is required for queue type sqs");
            }
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_sqs::Client::new(&aws_config);

            let consumer = Arc::new(rp_queue::sqs::SqsQueueConsumer::from_queue_url(
                client.clone(),
                config.queue.sqs.queue_url.clone(),
                config.queue.sqs.visibility_timeout as i32,
            ));
            let publisher = Arc::new(rp_queue::sqs::SqsQueuePublisher::new(
                client.clone(),
                config.queue.sqs.queue_url.clone(),
            ));
            let probe = Arc::new(rp_queue::sqs::SqsBrokerProbe::new(
                client,
                config.queue.sqs.queue_url.clone(),
            ));

            Ok(BrokerSetup {
                consumers: vec![consumer as Arc<dyn QueueConsumer + Send + Sync>],
                publisher,
                probe,
            })
        }
        "jetstream" => {
            let js = &config.queue.jetstream;
            let subject = format!("{}.pointers", js.stream.to_lowercase());

            let consumer = Arc::new(
                rp_queue::jetstream::JetStreamQueueConsumer::connect(
                    rp_queue::jetstream::JetStreamConsumerConfig {
                        url: js.url.clone(),
                        stream: js.stream.clone(),
                        subject: subject.clone(),
                        durable_name: js.consumer.clone(),
                        max_ack_pending: js.max_ack_pending,
                        max_deliver: js.max_deliver,
                        ack_wait: Duration::from_secs(js.ack_wait_seconds),
                        fetch_expires: Duration::from_millis(500),
                    },
                )
                .await?,
            );
            let publisher = Arc::new(
                rp_queue::jetstream::JetStreamQueuePublisher::connect(&js.url, subject).await?,
            );
            let probe = Arc::new(rp_queue::jetstream::JetStreamBrokerProbe::new(js.url.clone()));

            Ok(BrokerSetup {
                consumers: vec![consumer as Arc<dyn QueueConsumer + Send + Sync>],
                publisher,
                probe,
            })
        }
        "amqp" => {
            let amqp = &config.queue.amqp;
            let amqp_config = rp_queue::amqp::AmqpConfig {
                uri: amqp.uri.clone(),
                queue_name: amqp.queue_name.clone(),
                prefetch_count: amqp.prefetch_count,
                durable: amqp.durable,
                ..Default::default()
            };

            let consumer =
                Arc::new(rp_queue::amqp::AmqpQueueConsumer::connect(amqp_config.clone()).await?);
            let publisher =
                Arc::new(rp_queue::amqp::AmqpQueuePublisher::connect(amqp_config).await?);
            let probe = Arc::new(rp_queue::amqp::AmqpBrokerProbe::new(amqp.uri.clone()));

            Ok(BrokerSetup {
                consumers: vec![consumer as Arc<dyn QueueConsumer + Send + Sync>],
                publisher,
                probe,
            })
        }
        other => bail!("unknown queue type: {other}"),
    }
}

fn dev_topology(config: &AppConfig) -> RouterTopology {
    let base = format!("http://localhost:{}", config.http.port);
    RouterTopology {
        processing_pools: vec![
            PoolConfig {
                code: "DEFAULT".to_string(),
                concurrency: 10,
                rate_limit_per_minute: None,
                callback_url: Some(format!("{base}/api/test/fast")),
                timeout_ms: None,
                retries: None,
            },
            PoolConfig {
                code: "HIGH".to_string(),
                concurrency: 20,
                rate_limit_per_minute: None,
                callback_url: Some(format!("{base}/api/test/fast")),
                timeout_ms: None,
                retries: None,
            },
            PoolConfig {
                code: "LOW".to_string(),
                concurrency: 5,
                rate_limit_per_minute: Some(60),
                callback_url: Some(format!("{base}/api/test/fast")),
                timeout_ms: None,
                retries: None,
            },
        ],
        queues: vec![QueueBinding {
            name: "embedded".to_string(),
            uri: "embedded://local".to_string(),
            connections: config.queue.default_connections,
            visibility_timeout: config.queue.embedded.visibility_timeout_seconds,
        }],
    }
}

async fn spawn_leader_election(
    config: &AppConfig,
    instance_id: String,
    traffic: Arc<TrafficManager>,
) -> Result<()> {
    use rp_standby::{LeaderElection, LeaderElectionConfig, LeadershipStatus};

    let election = Arc::new(
        LeaderElection::new(LeaderElectionConfig {
            redis_url: config.standby.redis_url.clone(),
            lock_key: config.standby.lock_key.clone(),
            lock_ttl_seconds: config.standby.lock_ttl_seconds,
            heartbeat_interval_seconds: config.standby.heartbeat_interval_seconds,
            instance_id,
        })
        .await
        .context("leader election setup failed")?,
    );

    election.clone().start().await.context("leader election start failed")?;

    // Leadership drives the traffic role
    let mut status_rx = election.subscribe();
    tokio::spawn(async move {
        // Start paused until leadership is known
        let _ = traffic.become_standby().await;

        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow();
            let result = match status {
                LeadershipStatus::Leader => traffic.become_primary().await,
                LeadershipStatus::Follower | LeadershipStatus::Unknown => {
                    traffic.become_standby().await
                }
            };
            if let Err(e) = result {
                error!(error = %e, "Traffic transition from leadership change failed");
            }
        }
    });

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
