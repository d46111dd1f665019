//! All-in-one development loop.
//!
//! Embedded queue as broker and publisher, seeded pools pointed at the
//! built-in test endpoints, and the full monitoring API on one port.
//! Seed traffic with `POST /api/seed/messages`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use rp_common::{PoolConfig, QueueBinding, RouterTopology};
use rp_queue::embedded::{EmbeddedQueueConfig, EmbeddedQueueEngine};
use rp_router::api::{create_router, AppState};
use rp_router::{
    CircuitBreakerRegistry, HealthService, HealthServiceConfig, HttpMediator, HttpMediatorConfig,
    LifecycleConfig, LifecycleManager, QueueManager, TrafficManager, WarningService,
    WarningServiceConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    rp_common::logging::init_logging("rp-dev");

    let port: u16 = std::env::var("API_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    info!(port = port, "Starting Relaypoint dev server");

    // In-memory embedded queue doubles as broker and publisher
    let engine = EmbeddedQueueEngine::open(EmbeddedQueueConfig {
        queue_name: "dev".to_string(),
        db_path: None,
        visibility_timeout: Duration::from_secs(30),
        dedup_window: Duration::from_secs(300),
        checkpoint_interval: Duration::from_secs(10),
    })
    .await
    .context("embedded queue setup failed")?;

    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(
        HealthServiceConfig::default(),
        warning_service.clone(),
    ));
    let breakers = Arc::new(CircuitBreakerRegistry::default());

    let mediator = Arc::new(
        HttpMediator::new(
            HttpMediatorConfig {
                request_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            breakers.clone(),
        )
        .with_warning_service(warning_service.clone()),
    );

    let manager = Arc::new(QueueManager::new(mediator));
    manager.set_warning_service(warning_service.clone());
    manager.set_health_service(health_service.clone());
    manager.add_consumer(engine.clone()).await;

    let base = format!("http://localhost:{port}");
    manager
        .apply_config(RouterTopology {
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
                    code: "SLOW".to_string(),
                    concurrency: 2,
                    rate_limit_per_minute: Some(60),
                    callback_url: Some(format!("{base}/api/test/faulty")),
                    timeout_ms: None,
                    retries: None,
                },
            ],
            queues: vec![QueueBinding {
                name: "dev".to_string(),
                uri: "embedded://dev".to_string(),
                connections: 1,
                visibility_timeout: 30,
            }],
        })
        .await?;

    let lifecycle = LifecycleManager::start(
        manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        LifecycleConfig::default(),
    );

    let state = AppState {
        publisher: engine.clone(),
        manager: manager.clone(),
        warning_service,
        health_service,
        breakers,
        traffic: Arc::new(TrafficManager::with_noop_strategy()),
        standby_enabled: false,
        instance_id: uuid::Uuid::new_v4().to_string(),
        prometheus: None,
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    });

    let manager_task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start().await {
                error!(error = %e, "Queue manager error");
            }
        })
    };

    info!("Dev server ready. Try: curl -X POST localhost:{port}/api/seed/messages -H 'Content-Type: application/json' -d '{{\"count\":20}}'");

    signal::ctrl_c().await.expect("ctrl-c handler");
    info!("Shutting down dev server");

    lifecycle.shutdown();
    manager.shutdown().await;
    engine.close().await;
    server_task.abort();
    let _ = tokio::time::timeout(Duration::from_secs(5), manager_task).await;

    Ok(())
}
