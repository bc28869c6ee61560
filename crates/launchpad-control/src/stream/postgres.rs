//! PostgreSQL event stream.
//!
//! Three tables back the stream:
//!
//! - `stream_heads` holds the next offset per partition; appending locks the
//!   partition's head row so offsets are gap-free and strictly increasing.
//! - `stream_messages` holds the payloads keyed by `(partition, msg_offset)`.
//! - `stream_offsets` and `stream_leases` hold the consumer group's committed
//!   position and partition ownership.
//!
//! Trimming deletes message rows only; `stream_heads` keeps counting.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::{
    check_partition, partition_for, EventStream, Lease, StreamError, StreamMessage, StreamResult,
};

/// PostgreSQL-backed stream.
#[derive(Clone)]
pub struct PostgresStream {
    pool: PgPool,
    partitions: u32,
}

impl PostgresStream {
    /// Create a stream on an existing pool. Tables are created if missing.
    pub async fn from_pool(pool: PgPool, partitions: u32) -> StreamResult<Self> {
        let stream = Self {
            pool,
            partitions: partitions.max(1),
        };
        stream.ensure_schema().await?;
        Ok(stream)
    }

    async fn ensure_schema(&self) -> StreamResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_heads (
                partition INT PRIMARY KEY,
                next_offset BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_messages (
                partition INT NOT NULL,
                msg_offset BIGINT NOT NULL,
                payload BYTEA NOT NULL,
                appended_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (partition, msg_offset)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_offsets (
                consumer_group TEXT NOT NULL,
                partition INT NOT NULL,
                next_offset BIGINT NOT NULL,
                PRIMARY KEY (consumer_group, partition)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_leases (
                consumer_group TEXT NOT NULL,
                partition INT NOT NULL,
                holder TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (consumer_group, partition)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for partition in 0..self.partitions {
            sqlx::query(
                r#"
                INSERT INTO stream_heads (partition) VALUES ($1)
                ON CONFLICT (partition) DO NOTHING
                "#,
            )
            .bind(partition_param(partition))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    fn lost(lease: &Lease) -> StreamError {
        StreamError::LeaseLost {
            partition: lease.partition,
            holder: lease.holder.clone(),
        }
    }
}

fn partition_param(partition: u32) -> i32 {
    i32::try_from(partition).unwrap_or(i32::MAX)
}

fn offset_param(offset: u64) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

fn ttl_secs(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

#[async_trait]
impl EventStream for PostgresStream {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, key: &str, payload: &[u8]) -> StreamResult<StreamMessage> {
        let partition = partition_for(key, self.partitions);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE stream_heads
            SET next_offset = next_offset + 1
            WHERE partition = $1
            RETURNING next_offset - 1 AS msg_offset
            "#,
        )
        .bind(partition_param(partition))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StreamError::PartitionOutOfRange {
            partition,
            partitions: self.partitions,
        })?;
        let offset: i64 = row.get("msg_offset");

        let row = sqlx::query(
            r#"
            INSERT INTO stream_messages (partition, msg_offset, payload)
            VALUES ($1, $2, $3)
            RETURNING appended_at
            "#,
        )
        .bind(partition_param(partition))
        .bind(offset)
        .bind(payload)
        .fetch_one(&mut *tx)
        .await?;
        let appended_at: DateTime<Utc> = row.get("appended_at");

        tx.commit().await?;

        Ok(StreamMessage {
            partition,
            offset: u64::try_from(offset).unwrap_or_default(),
            payload: payload.to_vec(),
            appended_at,
        })
    }

    async fn fetch(
        &self,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        check_partition(partition, self.partitions)?;
        let rows = sqlx::query(
            r#"
            SELECT msg_offset, payload, appended_at
            FROM stream_messages
            WHERE partition = $1 AND msg_offset >= $2
            ORDER BY msg_offset
            LIMIT $3
            "#,
        )
        .bind(partition_param(partition))
        .bind(offset_param(from_offset))
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let offset: i64 = row.get("msg_offset");
                StreamMessage {
                    partition,
                    offset: u64::try_from(offset).unwrap_or_default(),
                    payload: row.get("payload"),
                    appended_at: row.get("appended_at"),
                }
            })
            .collect())
    }

    async fn committed(&self, group: &str, partition: u32) -> StreamResult<u64> {
        check_partition(partition, self.partitions)?;
        let next: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT next_offset FROM stream_offsets
            WHERE consumer_group = $1 AND partition = $2
            "#,
        )
        .bind(group)
        .bind(partition_param(partition))
        .fetch_optional(&self.pool)
        .await?;

        Ok(next.and_then(|n| u64::try_from(n).ok()).unwrap_or(0))
    }

    async fn commit(&self, lease: &Lease, next_offset: u64) -> StreamResult<()> {
        // The lease check and the write are one statement, so a consumer that
        // lost its lease cannot move the position.
        let result = sqlx::query(
            r#"
            INSERT INTO stream_offsets (consumer_group, partition, next_offset)
            SELECT $1, $2, $3
            WHERE EXISTS (
                SELECT 1 FROM stream_leases
                WHERE consumer_group = $1 AND partition = $2
                  AND holder = $4 AND expires_at > NOW()
            )
            ON CONFLICT (consumer_group, partition)
            DO UPDATE SET next_offset = EXCLUDED.next_offset
            "#,
        )
        .bind(&lease.group)
        .bind(partition_param(lease.partition))
        .bind(offset_param(next_offset))
        .bind(&lease.holder)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::lost(lease));
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        group: &str,
        partition: u32,
        holder: &str,
        ttl: Duration,
    ) -> StreamResult<Option<Lease>> {
        check_partition(partition, self.partitions)?;
        let row = sqlx::query(
            r#"
            INSERT INTO stream_leases (consumer_group, partition, holder, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (consumer_group, partition) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE stream_leases.expires_at <= NOW() OR stream_leases.holder = EXCLUDED.holder
            RETURNING expires_at
            "#,
        )
        .bind(group)
        .bind(partition_param(partition))
        .bind(holder)
        .bind(ttl_secs(ttl))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Lease {
            group: group.to_owned(),
            partition,
            holder: holder.to_owned(),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn heartbeat(&self, lease: &Lease, ttl: Duration) -> StreamResult<Lease> {
        let row = sqlx::query(
            r#"
            UPDATE stream_leases
            SET expires_at = NOW() + make_interval(secs => $4)
            WHERE consumer_group = $1 AND partition = $2 AND holder = $3
              AND expires_at > NOW()
            RETURNING expires_at
            "#,
        )
        .bind(&lease.group)
        .bind(partition_param(lease.partition))
        .bind(&lease.holder)
        .bind(ttl_secs(ttl))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Self::lost(lease))?;

        Ok(Lease {
            expires_at: row.get("expires_at"),
            ..lease.clone()
        })
    }

    async fn release_lease(&self, lease: &Lease) -> StreamResult<()> {
        sqlx::query(
            r#"
            DELETE FROM stream_leases
            WHERE consumer_group = $1 AND partition = $2 AND holder = $3
            "#,
        )
        .bind(&lease.group)
        .bind(partition_param(lease.partition))
        .bind(&lease.holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn trim(&self, partition: u32) -> StreamResult<u64> {
        check_partition(partition, self.partitions)?;
        let result = sqlx::query(
            r#"
            DELETE FROM stream_messages
            WHERE partition = $1
              AND msg_offset < (
                  SELECT MIN(next_offset) FROM stream_offsets WHERE partition = $1
              )
            "#,
        )
        .bind(partition_param(partition))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

impl std::fmt::Debug for PostgresStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStream")
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use sqlx::postgres::PgPoolOptions;

    use super::*;

    async fn connect() -> PostgresStream {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .expect("failed to connect");
        PostgresStream::from_pool(pool, 2)
            .await
            .expect("failed to create schema")
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn publish_and_fetch_in_order() {
        let stream = connect().await;
        let key = ulid::Ulid::new().to_string();

        let first = stream.publish(&key, b"one").await.unwrap();
        let second = stream.publish(&key, b"two").await.unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);

        let read = stream.fetch(first.partition, first.offset, 2).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].payload, b"one");
        assert_eq!(read[1].payload, b"two");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn lease_fences_commits() {
        let stream = connect().await;
        let group = format!("test-{}", ulid::Ulid::new());
        let ttl = Duration::from_secs(30);

        let lease = stream
            .acquire_lease(&group, 0, "a", ttl)
            .await
            .unwrap()
            .expect("lease");
        assert!(stream
            .acquire_lease(&group, 0, "b", ttl)
            .await
            .unwrap()
            .is_none());

        stream.commit(&lease, 5).await.unwrap();
        assert_eq!(stream.committed(&group, 0).await.unwrap(), 5);

        stream.release_lease(&lease).await.unwrap();
        let err = stream.commit(&lease, 6).await.unwrap_err();
        assert!(matches!(err, StreamError::LeaseLost { .. }));
        assert_eq!(stream.committed(&group, 0).await.unwrap(), 5);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn trim_keeps_uncommitted_messages() {
        let stream = connect().await;
        let key = ulid::Ulid::new().to_string();
        let group = format!("test-{}", ulid::Ulid::new());
        let ttl = Duration::from_secs(30);

        let first = stream.publish(&key, b"one").await.unwrap();
        let second = stream.publish(&key, b"two").await.unwrap();
        let lease = stream
            .acquire_lease(&group, first.partition, "a", ttl)
            .await
            .unwrap()
            .expect("lease");
        stream.commit(&lease, second.offset).await.unwrap();

        // Other test groups may hold older positions; only check what must survive.
        stream.trim(first.partition).await.unwrap();
        let read = stream.fetch(first.partition, second.offset, 1).await.unwrap();
        assert_eq!(read[0].payload, b"two");
    }
}
