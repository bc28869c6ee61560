//! In-memory event stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    check_partition, lease_deadline, partition_for, EventStream, Lease, StreamError, StreamMessage,
    StreamResult,
};

/// One partition's retained messages. `base` is the offset of the front entry.
#[derive(Debug, Default)]
struct PartitionLog {
    base: u64,
    messages: VecDeque<StreamMessage>,
}

impl PartitionLog {
    fn next_offset(&self) -> u64 {
        self.base + self.messages.len() as u64
    }
}

#[derive(Debug, Default)]
struct Inner {
    partitions: Vec<PartitionLog>,
    offsets: HashMap<(String, u32), u64>,
    leases: HashMap<(String, u32), Lease>,
}

/// In-process stream for tests and single-node runs. Nothing survives a restart.
#[derive(Debug, Clone)]
pub struct MemoryStream {
    partitions: u32,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStream {
    /// Create a stream with `partitions` partitions (at least one).
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        let inner = Inner {
            partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
            ..Inner::default()
        };
        Self {
            partitions,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Number of messages currently held in `partition`.
    pub async fn len(&self, partition: u32) -> usize {
        let inner = self.inner.lock().await;
        inner
            .partitions
            .get(partition as usize)
            .map_or(0, |log| log.messages.len())
    }

    fn holds(inner: &Inner, lease: &Lease) -> bool {
        inner
            .leases
            .get(&(lease.group.clone(), lease.partition))
            .is_some_and(|current| current.holder == lease.holder && current.expires_at > Utc::now())
    }

    fn lost(lease: &Lease) -> StreamError {
        StreamError::LeaseLost {
            partition: lease.partition,
            holder: lease.holder.clone(),
        }
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl EventStream for MemoryStream {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, key: &str, payload: &[u8]) -> StreamResult<StreamMessage> {
        let partition = partition_for(key, self.partitions);
        let mut inner = self.inner.lock().await;
        let log = inner
            .partitions
            .get_mut(partition as usize)
            .ok_or(StreamError::PartitionOutOfRange {
                partition,
                partitions: self.partitions,
            })?;

        let message = StreamMessage {
            partition,
            offset: log.next_offset(),
            payload: payload.to_vec(),
            appended_at: Utc::now(),
        };
        log.messages.push_back(message.clone());
        Ok(message)
    }

    async fn fetch(
        &self,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        check_partition(partition, self.partitions)?;
        let inner = self.inner.lock().await;
        let Some(log) = inner.partitions.get(partition as usize) else {
            return Ok(Vec::new());
        };
        let skip = usize::try_from(from_offset.saturating_sub(log.base)).unwrap_or(usize::MAX);
        Ok(log.messages.iter().skip(skip).take(max).cloned().collect())
    }

    async fn committed(&self, group: &str, partition: u32) -> StreamResult<u64> {
        check_partition(partition, self.partitions)?;
        let inner = self.inner.lock().await;
        Ok(inner
            .offsets
            .get(&(group.to_owned(), partition))
            .copied()
            .unwrap_or(0))
    }

    async fn commit(&self, lease: &Lease, next_offset: u64) -> StreamResult<()> {
        let mut inner = self.inner.lock().await;
        if !Self::holds(&inner, lease) {
            return Err(Self::lost(lease));
        }
        inner
            .offsets
            .insert((lease.group.clone(), lease.partition), next_offset);
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
        let mut inner = self.inner.lock().await;
        let key = (group.to_owned(), partition);

        if let Some(current) = inner.leases.get(&key) {
            if current.holder != holder && current.expires_at > Utc::now() {
                return Ok(None);
            }
        }

        let lease = Lease {
            group: group.to_owned(),
            partition,
            holder: holder.to_owned(),
            expires_at: lease_deadline(ttl),
        };
        inner.leases.insert(key, lease.clone());
        Ok(Some(lease))
    }

    async fn heartbeat(&self, lease: &Lease, ttl: Duration) -> StreamResult<Lease> {
        let mut inner = self.inner.lock().await;
        if !Self::holds(&inner, lease) {
            return Err(Self::lost(lease));
        }
        let renewed = Lease {
            expires_at: lease_deadline(ttl),
            ..lease.clone()
        };
        inner
            .leases
            .insert((lease.group.clone(), lease.partition), renewed.clone());
        Ok(renewed)
    }

    async fn release_lease(&self, lease: &Lease) -> StreamResult<()> {
        let mut inner = self.inner.lock().await;
        let key = (lease.group.clone(), lease.partition);
        if inner
            .leases
            .get(&key)
            .is_some_and(|current| current.holder == lease.holder)
        {
            inner.leases.remove(&key);
        }
        Ok(())
    }

    async fn trim(&self, partition: u32) -> StreamResult<u64> {
        check_partition(partition, self.partitions)?;
        let mut inner = self.inner.lock().await;
        let Some(floor) = inner
            .offsets
            .iter()
            .filter(|((_, p), _)| *p == partition)
            .map(|(_, next)| *next)
            .min()
        else {
            return Ok(0);
        };
        let Some(log) = inner.partitions.get_mut(partition as usize) else {
            return Ok(0);
        };

        let mut removed = 0;
        while log.base < floor && log.messages.pop_front().is_some() {
            log.base += 1;
            removed += 1;
        }
        Ok(removed)
    }
}
