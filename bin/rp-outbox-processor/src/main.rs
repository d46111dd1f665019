//! Relaypoint outbox processor.
//!
//! Polls a customer outbox database (sqlite or postgres by URL scheme) and
//! forwards items to the platform batch endpoints. With standby enabled,
//! Redis leader election gates polling to one instance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{error, info};

use rp_config::AppConfig;
use rp_outbox::{
    HttpBatchDispatcher, HttpBatchDispatcherConfig, OutboxProcessor, OutboxProcessorConfig,
    OutboxRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    rp_common::logging::init_logging("rp-outbox-processor");

    let config = AppConfig::load().context("configuration load failed")?;

    info!(
        database_url = %config.outbox.database_url,
        api_base_url = %config.outbox.api_base_url,
        "Starting outbox processor"
    );

    let repository = build_repository(&config).await?;
    repository.init_schema().await.context("outbox schema init failed")?;

    let dispatcher = Arc::new(
        HttpBatchDispatcher::new(HttpBatchDispatcherConfig {
            api_base_url: config.outbox.api_base_url.clone(),
            api_token: if config.outbox.api_token.is_empty() {
                None
            } else {
                Some(config.outbox.api_token.clone())
            },
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        })
        .context("dispatcher setup failed")?,
    );

    let processor = Arc::new(OutboxProcessor::new(
        OutboxProcessorConfig {
            poll_interval: Duration::from_millis(config.outbox.poll_interval_ms),
            poll_batch_size: config.outbox.poll_batch_size,
            api_batch_size: config.outbox.api_batch_size,
            max_concurrent_groups: config.outbox.max_concurrent_groups,
            global_buffer_size: config.outbox.global_buffer_size,
            max_in_flight: config.outbox.max_in_flight,
            processing_timeout: Duration::from_secs(config.outbox.processing_timeout_seconds),
            recovery_interval: Duration::from_millis(config.outbox.recovery_interval_ms),
            group_idle_timeout_secs: 300,
        },
        repository,
        dispatcher,
    ));

    if config.standby.enabled {
        spawn_leader_election(&config, processor.clone()).await?;
        processor.set_primary(false);
    }

    let runner = {
        let processor = processor.clone();
        tokio::spawn(async move {
            processor.start().await;
        })
    };

    shutdown_signal().await;
    info!("Shutdown signal received");
    processor.stop();

    let _ = tokio::time::timeout(Duration::from_secs(30), runner).await;
    info!("Outbox processor shutdown complete");
    Ok(())
}

async fn build_repository(config: &AppConfig) -> Result<Arc<dyn OutboxRepository>> {
    let url = &config.outbox.database_url;

    if url.starts_with("sqlite:") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .with_context(|| format!("sqlite connect failed: {url}"))?;
        Ok(Arc::new(rp_outbox::sqlite::SqliteOutboxRepository::new(pool)))
    } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .with_context(|| format!("postgres connect failed: {url}"))?;
        Ok(Arc::new(rp_outbox::postgres::PostgresOutboxRepository::new(pool)))
    } else {
        bail!("unsupported outbox database URL: {url}");
    }
}

async fn spawn_leader_election(config: &AppConfig, processor: Arc<OutboxProcessor>) -> Result<()> {
    use rp_standby::{LeaderElection, LeaderElectionConfig, LeadershipStatus};

    let instance_id = if config.standby.instance_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.standby.instance_id.clone()
    };

    let election = Arc::new(
        LeaderElection::new(LeaderElectionConfig {
            redis_url: config.standby.redis_url.clone(),
            lock_key: format!("{}:outbox", config.standby.lock_key),
            lock_ttl_seconds: config.standby.lock_ttl_seconds,
            heartbeat_interval_seconds: config.standby.heartbeat_interval_seconds,
            instance_id,
        })
        .await
        .context("leader election setup failed")?,
    );

    election.clone().start().await.context("leader election start failed")?;

    let mut status_rx = election.subscribe();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let leader = *status_rx.borrow() == LeadershipStatus::Leader;
            processor.set_primary(leader);
        }
        error!("Leader election channel closed");
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
