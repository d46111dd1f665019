//! Projection pump.
//!
//! Drains the routing change-log table into the read projection in one
//! atomic multi-CTE statement per cycle: select a batch of unprocessed
//! rows, upsert the INSERT rows (re-deriving the client and channel halves
//! of the colon-delimited code), apply the UPDATE rows with
//! null-preserving coalesce, then mark the batch processed.
//!
//! Pacing: no sleep after a full batch, 100 ms after a partial one, 1 s
//! when empty, and a 5 s backoff on error.

use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, ProjectionError>;

#[derive(Debug, Clone)]
pub struct ProjectionPumpConfig {
    pub batch_size: i64,
    pub partial_batch_sleep: Duration,
    pub empty_sleep: Duration,
    pub error_backoff: Duration,
}

impl Default for ProjectionPumpConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            partial_batch_sleep: Duration::from_millis(100),
            empty_sleep: Duration::from_millis(1000),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// The whole drain cycle is one statement so a crash can never leave a row
/// applied but unmarked (or the reverse).
const DRAIN_STATEMENT: &str = r#"
WITH batch AS (
    SELECT id, op, code, display_name, endpoint_url, active
    FROM routing_change_log
    WHERE processed = FALSE
    ORDER BY id
    LIMIT $1
),
inserted AS (
    INSERT INTO routing_directory (code, client_code, channel_code, display_name, endpoint_url, active)
    SELECT code,
           split_part(code, ':', 1),
           split_part(code, ':', 2),
           display_name,
           endpoint_url,
           COALESCE(active, TRUE)
    FROM batch
    WHERE op = 'INSERT'
    ON CONFLICT (code) DO UPDATE SET
        display_name = EXCLUDED.display_name,
        endpoint_url = EXCLUDED.endpoint_url,
        active = EXCLUDED.active
),
updated AS (
    UPDATE routing_directory d SET
        display_name = COALESCE(b.display_name, d.display_name),
        endpoint_url = COALESCE(b.endpoint_url, d.endpoint_url),
        active = COALESCE(b.active, d.active)
    FROM batch b
    WHERE b.op = 'UPDATE' AND d.code = b.code
)
UPDATE routing_change_log
SET processed = TRUE
WHERE id IN (SELECT id FROM batch)
"#;

pub struct ProjectionPump {
    pool: PgPool,
    config: ProjectionPumpConfig,
}

impl ProjectionPump {
    pub fn new(pool: PgPool, config: ProjectionPumpConfig) -> Self {
        Self { pool, config }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS routing_change_log (
                id BIGSERIAL PRIMARY KEY,
                op TEXT NOT NULL,
                code TEXT NOT NULL,
                display_name TEXT,
                endpoint_url TEXT,
                active BOOLEAN,
                processed BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_change_log_unprocessed \
             ON routing_change_log (id) WHERE processed = FALSE",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS routing_directory (
                code TEXT PRIMARY KEY,
                client_code TEXT NOT NULL,
                channel_code TEXT NOT NULL,
                display_name TEXT,
                endpoint_url TEXT,
                active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Projection schema initialized");
        Ok(())
    }

    /// One drain cycle. Returns how many change-log rows were consumed.
    pub async fn drain_once(&self) -> Result<u64> {
        let result = sqlx::query(DRAIN_STATEMENT)
            .bind(self.config.batch_size)
            .execute(&self.pool)
            .await?;

        let drained = result.rows_affected();
        if drained > 0 {
            debug!(drained = drained, "Drained change-log batch into projection");
        }
        Ok(drained)
    }

    /// Run until the task is aborted.
    pub async fn run(&self) {
        info!(batch_size = self.config.batch_size, "Projection pump started");

        loop {
            match self.drain_once().await {
                Ok(drained) if drained >= self.config.batch_size as u64 => {
                    // Full batch: drain again immediately
                }
                Ok(0) => tokio::time::sleep(self.config.empty_sleep).await,
                Ok(_) => tokio::time::sleep(self.config.partial_batch_sleep).await,
                Err(e) => {
                    error!(error = %e, "Projection drain failed, backing off");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pacing() {
        let config = ProjectionPumpConfig::default();
        assert_eq!(config.partial_batch_sleep, Duration::from_millis(100));
        assert_eq!(config.empty_sleep, Duration::from_millis(1000));
        assert_eq!(config.error_backoff, Duration::from_secs(5));
    }

    #[test]
    fn drain_statement_touches_all_stages() {
        // Sanity-check the CTE wiring without a database.
        assert!(DRAIN_STATEMENT.contains("WITH batch AS"));
        assert!(DRAIN_STATEMENT.contains("split_part(code, ':', 1)"));
        assert!(DRAIN_STATEMENT.contains("COALESCE(b.display_name, d.display_name)"));
        assert!(DRAIN_STATEMENT.contains("SET processed = TRUE"));
    }
}
