//! Config file discovery and environment overrides.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "relaypoint.toml",
    "./config/relaypoint.toml",
    "/etc/relaypoint/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAYPOINT_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        set_string(&mut config.http.host, "API_HOST");
        set_parsed(&mut config.http.port, "API_PORT");

        set_string(&mut config.queue.queue_type, "QUEUE_TYPE");
        set_parsed(&mut config.queue.default_connections, "DEFAULT_CONNECTIONS");
        set_string(&mut config.queue.embedded.db_path, "EMBEDDED_DB_PATH");
        set_parsed(
            &mut config.queue.embedded.visibility_timeout_seconds,
            "EMBEDDED_VISIBILITY_TIMEOUT_SECONDS",
        );
        set_parsed(
            &mut config.queue.embedded.dedup_window_seconds,
            "EMBEDDED_DEDUP_WINDOW_SECONDS",
        );
        set_parsed(
            &mut config.queue.embedded.checkpoint_interval_seconds,
            "EMBEDDED_CHECKPOINT_INTERVAL_SECONDS",
        );
        set_string(&mut config.queue.sqs.queue_url, "SQS_QUEUE_URL");
        set_string(&mut config.queue.sqs.region, "SQS_REGION");
        set_parsed(&mut config.queue.sqs.visibility_timeout, "SQS_VISIBILITY_TIMEOUT");
        set_string(&mut config.queue.jetstream.url, "JETSTREAM_URL");
        set_string(&mut config.queue.jetstream.stream, "JETSTREAM_STREAM");
        set_string(&mut config.queue.jetstream.consumer, "JETSTREAM_CONSUMER");
        set_parsed(&mut config.queue.jetstream.max_ack_pending, "JETSTREAM_MAX_ACK_PENDING");
        set_parsed(&mut config.queue.jetstream.max_deliver, "JETSTREAM_MAX_DELIVER");
        set_parsed(&mut config.queue.jetstream.ack_wait_seconds, "JETSTREAM_ACK_WAIT_SECONDS");
        set_string(&mut config.queue.amqp.uri, "AMQP_URI");
        set_string(&mut config.queue.amqp.queue_name, "AMQP_QUEUE_NAME");

        set_parsed(&mut config.router.max_pools, "MAX_POOLS");
        set_parsed(&mut config.router.pool_warning_threshold, "POOL_WARNING_THRESHOLD");
        set_parsed(&mut config.router.mediation.connect_timeout_ms, "MEDIATION_CONNECT_TIMEOUT_MS");
        set_parsed(&mut config.router.mediation.request_timeout_ms, "MEDIATION_REQUEST_TIMEOUT_MS");
        set_parsed(&mut config.router.mediation.headers_timeout_ms, "MEDIATION_HEADERS_TIMEOUT_MS");
        set_parsed(&mut config.router.mediation.retries, "MEDIATION_RETRIES");
        set_parsed(&mut config.router.mediation.retry_delay_ms, "MEDIATION_RETRY_DELAY_MS");
        set_parsed(&mut config.router.broker_health.check_interval_ms, "HEALTH_CHECK_INTERVAL_MS");
        set_parsed(
            &mut config.router.broker_health.failure_threshold,
            "HEALTH_CHECK_FAILURE_THRESHOLD",
        );
        set_parsed(
            &mut config.router.queue_health.backlog_threshold,
            "QUEUE_HEALTH_BACKLOG_THRESHOLD",
        );
        set_parsed(
            &mut config.router.queue_health.growth_threshold,
            "QUEUE_HEALTH_GROWTH_THRESHOLD",
        );
        set_parsed(&mut config.router.queue_health.growth_periods, "QUEUE_HEALTH_GROWTH_PERIODS");

        if let Ok(val) = env::var("CONFIG_SYNC_URL") {
            config.router.config_sync.enabled = true;
            config.router.config_sync.config_url = val;
        }
        set_parsed(&mut config.router.config_sync.interval_seconds, "CONFIG_SYNC_INTERVAL_SECONDS");

        set_string(&mut config.outbox.database_url, "OUTBOX_DATABASE_URL");
        set_string(&mut config.outbox.api_base_url, "OUTBOX_API_BASE_URL");
        set_string(&mut config.outbox.api_token, "OUTBOX_API_TOKEN");
        set_parsed(&mut config.outbox.poll_interval_ms, "OUTBOX_POLL_INTERVAL_MS");
        set_parsed(&mut config.outbox.poll_batch_size, "OUTBOX_POLL_BATCH_SIZE");
        set_parsed(&mut config.outbox.api_batch_size, "OUTBOX_API_BATCH_SIZE");
        set_parsed(&mut config.outbox.max_concurrent_groups, "OUTBOX_MAX_CONCURRENT_GROUPS");
        set_parsed(&mut config.outbox.global_buffer_size, "OUTBOX_GLOBAL_BUFFER_SIZE");
        set_parsed(&mut config.outbox.max_in_flight, "OUTBOX_MAX_IN_FLIGHT");
        set_parsed(&mut config.outbox.max_retries, "OUTBOX_MAX_RETRIES");
        set_parsed(
            &mut config.outbox.processing_timeout_seconds,
            "OUTBOX_PROCESSING_TIMEOUT_SECONDS",
        );
        set_parsed(&mut config.outbox.recovery_interval_ms, "OUTBOX_RECOVERY_INTERVAL_MS");

        if let Ok(val) = env::var("PROJECTION_DATABASE_URL") {
            config.projection.enabled = true;
            config.projection.database_url = val;
        }
        set_parsed(&mut config.projection.batch_size, "PROJECTION_BATCH_SIZE");

        if let Ok(val) = env::var("STANDBY_ENABLED") {
            config.standby.enabled = val == "true" || val == "1";
        }
        set_string(&mut config.standby.redis_url, "STANDBY_REDIS_URL");
        set_string(&mut config.standby.lock_key, "STANDBY_LOCK_KEY");
        set_parsed(&mut config.standby.lock_ttl_seconds, "STANDBY_LOCK_TTL_SECONDS");
        set_parsed(
            &mut config.standby.heartbeat_interval_seconds,
            "STANDBY_HEARTBEAT_INTERVAL_SECONDS",
        );
        set_string(&mut config.standby.instance_id, "INSTANCE_ID");

        set_string(&mut config.data_dir, "DATA_DIR");
        if let Ok(val) = env::var("DEV_MODE") {
            config.dev_mode = val == "true" || val == "1";
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn set_string(target: &mut String, var: &str) {
    if let Ok(val) = env::var(var) {
        *target = val;
    }
}

fn set_parsed<T: std::str::FromStr>(target: &mut T, var: &str) {
    if let Ok(val) = env::var(var) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}
