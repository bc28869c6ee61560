//! PostgreSQL event store.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, EventId, LogEvent};

use super::{AppendOutcome, EventStore};

/// PostgreSQL-backed event store.
///
/// Rows are keyed by event id with a unique secondary key on
/// `(deployment_id, sequence)`.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_events (
                event_id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                log TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                CONSTRAINT uq_log_events_deployment_sequence UNIQUE (deployment_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> ControlResult<LogEvent> {
        let sequence: i64 = row.get("sequence");
        let metadata = match row.get::<serde_json::Value, _>("metadata") {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(ControlError::Serialisation(format!(
                    "log event metadata is not an object: {other}"
                )))
            }
        };

        Ok(LogEvent {
            event_id: EventId::new(row.get::<String, _>("event_id")),
            deployment_id: DeploymentId::new(row.get::<String, _>("deployment_id")),
            sequence: u64::try_from(sequence).unwrap_or_default(),
            timestamp: row.get("timestamp"),
            log: row.get("log"),
            metadata,
        })
    }
}

fn sequence_param(sequence: u64) -> i64 {
    i64::try_from(sequence).unwrap_or(i64::MAX)
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn ping(&self) -> ControlResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn append(&self, event: &LogEvent) -> ControlResult<AppendOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO log_events (event_id, deployment_id, sequence, timestamp, log, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(event.event_id.as_str())
        .bind(event.deployment_id.as_str())
        .bind(sequence_param(event.sequence))
        .bind(event.timestamp)
        .bind(&event.log)
        .bind(serde_json::Value::Object(event.metadata.clone()))
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 0 {
            AppendOutcome::Duplicate
        } else {
            AppendOutcome::Inserted
        })
    }

    async fn list(
        &self,
        deployment_id: &DeploymentId,
        after: Option<u64>,
        limit: usize,
    ) -> ControlResult<Vec<LogEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, deployment_id, sequence, timestamp, log, metadata
            FROM log_events
            WHERE deployment_id = $1 AND ($2::BIGINT IS NULL OR sequence > $2)
            ORDER BY sequence
            LIMIT $3
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(after.map(sequence_param))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn tail(&self, deployment_id: &DeploymentId, n: usize) -> ControlResult<Vec<LogEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT event_id, deployment_id, sequence, timestamp, log, metadata
                FROM log_events
                WHERE deployment_id = $1
                ORDER BY sequence DESC
                LIMIT $2
            ) last ORDER BY sequence
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }
}

impl std::fmt::Debug for PostgresEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEventStore").finish_non_exhaustive()
    }
}
