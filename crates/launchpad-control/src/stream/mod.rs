//! Partitioned, ordered event stream between build workers and ingestion.
//!
//! Messages are appended to one of a fixed number of partitions chosen by
//! hashing a key (the deployment id), so every message for one deployment
//! lands in the same partition and is read back in append order. Each
//! partition has a consumer-group position that only moves forward when a
//! consumer commits, and a lease that lets exactly one consumer own the
//! partition at a time. Messages every known group has committed past can be
//! trimmed; offsets are never reused.

mod memory;
mod postgres;

pub use memory::MemoryStream;
pub use postgres::PostgresStream;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Result type alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors returned by stream backends.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The broker could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The partition is outside `0..partitions`.
    #[error("partition {partition} out of range (stream has {partitions})")]
    PartitionOutOfRange {
        /// Requested partition.
        partition: u32,
        /// Partition count.
        partitions: u32,
    },

    /// The lease expired or was taken over by another consumer.
    #[error("lease on partition {partition} lost by {holder}")]
    LeaseLost {
        /// Partition the lease was for.
        partition: u32,
        /// Holder that lost it.
        holder: String,
    },

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StreamError {
    /// Whether retrying the operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }
}

impl From<sqlx::Error> for StreamError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::Timeout,
            sqlx::Error::Io(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_) => Self::Connection(err.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

/// A message read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Partition the message was appended to.
    pub partition: u32,
    /// Position within the partition, starting at zero.
    pub offset: u64,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// When the message was appended.
    pub appended_at: DateTime<Utc>,
}

/// A consumer's time-bounded claim on a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Consumer group the lease belongs to.
    pub group: String,
    /// Leased partition.
    pub partition: u32,
    /// Unique holder token.
    pub holder: String,
    /// When the lease lapses unless heartbeated.
    pub expires_at: DateTime<Utc>,
}

/// Choose the partition for a key.
///
/// The first four bytes of the key's SHA-256 digest, read big-endian, modulo
/// the partition count. Stable across processes and restarts.
#[must_use]
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head % partitions.max(1)
}

/// Backend for the partitioned event stream.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Number of partitions.
    fn partitions(&self) -> u32;

    /// Append `payload` to the partition selected by `key`.
    async fn publish(&self, key: &str, payload: &[u8]) -> StreamResult<StreamMessage>;

    /// Read up to `max` messages from `partition` starting at `from_offset`,
    /// in offset order.
    async fn fetch(
        &self,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> StreamResult<Vec<StreamMessage>>;

    /// The next offset the group should read from `partition`.
    async fn committed(&self, group: &str, partition: u32) -> StreamResult<u64>;

    /// Record that every message before `next_offset` has been processed.
    ///
    /// Fails with [`StreamError::LeaseLost`] if `lease` is no longer held.
    async fn commit(&self, lease: &Lease, next_offset: u64) -> StreamResult<()>;

    /// Try to claim `partition` for the group. Returns `None` while another
    /// holder's lease is live.
    async fn acquire_lease(
        &self,
        group: &str,
        partition: u32,
        holder: &str,
        ttl: Duration,
    ) -> StreamResult<Option<Lease>>;

    /// Extend a held lease.
    async fn heartbeat(&self, lease: &Lease, ttl: Duration) -> StreamResult<Lease>;

    /// Give the partition up.
    async fn release_lease(&self, lease: &Lease) -> StreamResult<()>;

    /// Delete the messages of `partition` below the lowest position committed
    /// by any group. A partition nobody has committed on keeps everything.
    ///
    /// Returns the number of messages removed.
    async fn trim(&self, partition: u32) -> StreamResult<u64>;
}

fn check_partition(partition: u32, partitions: u32) -> StreamResult<()> {
    if partition >= partitions {
        return Err(StreamError::PartitionOutOfRange {
            partition,
            partitions,
        });
    }
    Ok(())
}

fn lease_deadline(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}
