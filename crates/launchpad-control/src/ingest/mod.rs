//! Log ingestion pipeline.
//!
//! One consumer per stream partition. For each message, in partition order:
//!
//! 1. parse the payload; malformed messages are counted, logged and skipped
//! 2. append the log event (idempotent on `(deployment_id, sequence)`)
//! 3. classify the line against the marker rules and apply the resulting
//!    compare-and-set transition
//! 4. commit the partition position past the message
//!
//! Step 3 also runs for duplicates so a crash between 2 and 3 cannot lose a
//! transition. Transient store failures are retried with exponential backoff
//! and the position never moves past a message that was not persisted.

mod event;

pub use event::{
    WorkerMessage, MAX_EMITTER_SEQUENCE, META_DEPLOYMENT_ID, META_PROJECT_ID, OFFSET_SEQUENCE_BASE,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IngestionConfig;
use crate::error::{ControlError, ControlResult};
use crate::events::{AppendOutcome, EventStore, LogBroadcaster};
use crate::markers::MarkerSet;
use crate::store::DeploymentStore;
use crate::stream::{EventStream, Lease, StreamError, StreamMessage};
use crate::types::{DeploymentId, DeploymentStatus, TransitionOutcome};

/// Counters exposed on the metrics endpoint.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    persisted: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    transitions: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    /// Messages read from the stream.
    pub received: u64,
    /// Events newly stored.
    pub persisted: u64,
    /// Redelivered events absorbed by the idempotent append.
    pub duplicates: u64,
    /// Messages skipped because they could not be parsed.
    pub malformed: u64,
    /// Messages skipped after a non-transient store error.
    pub rejected: u64,
    /// Status transitions applied.
    pub transitions: u64,
    /// Transient-failure retries.
    pub retries: u64,
}

impl PipelineStats {
    /// Take a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// The event is durably stored.
    Stored {
        /// Whether this delivery inserted or hit an existing event.
        append: AppendOutcome,
        /// Transition applied or refused for a matched marker.
        transition: Option<TransitionOutcome>,
    },
    /// The payload could not be parsed.
    Malformed,
    /// A non-transient store error; the message is skipped.
    Rejected,
}

/// Consumes the event stream into the event and deployment stores.
pub struct IngestionPipeline {
    stream: Arc<dyn EventStream>,
    events: Arc<dyn EventStore>,
    store: Arc<dyn DeploymentStore>,
    broadcaster: LogBroadcaster,
    markers: MarkerSet,
    config: IngestionConfig,
    group: String,
    stats: Arc<PipelineStats>,
}

impl IngestionPipeline {
    /// Create a new pipeline consuming as `group`.
    pub fn new(
        stream: Arc<dyn EventStream>,
        events: Arc<dyn EventStore>,
        store: Arc<dyn DeploymentStore>,
        broadcaster: LogBroadcaster,
        config: IngestionConfig,
        group: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            events,
            store,
            broadcaster,
            markers: config.marker_set(),
            config,
            group: group.into(),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Number of partitions to consume.
    #[must_use]
    pub fn partitions(&self) -> u32 {
        self.stream.partitions()
    }

    /// Handle one message: parse, persist, classify, transition.
    ///
    /// Does not retry. Transient errors are returned to the caller.
    pub async fn process(&self, message: &StreamMessage) -> ControlResult<Processed> {
        PipelineStats::bump(&self.stats.received);

        let parsed = match WorkerMessage::parse(&message.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                PipelineStats::bump(&self.stats.malformed);
                warn!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "skipping malformed event"
                );
                return Ok(Processed::Malformed);
            }
        };

        let event = parsed.into_log_event(message);
        let append = self.events.append(&event).await?;
        match append {
            AppendOutcome::Inserted => {
                PipelineStats::bump(&self.stats.persisted);
                self.broadcaster.publish(&event);
            }
            AppendOutcome::Duplicate => {
                PipelineStats::bump(&self.stats.duplicates);
                debug!(
                    deployment_id = %event.deployment_id,
                    sequence = event.sequence,
                    "duplicate event absorbed"
                );
            }
        }

        let transition = match self.markers.classify(&event.log) {
            Some(to) => self.apply(&event.deployment_id, to, &event.log).await?,
            None => None,
        };

        Ok(Processed::Stored { append, transition })
    }

    async fn apply(
        &self,
        deployment_id: &DeploymentId,
        to: DeploymentStatus,
        line: &str,
    ) -> ControlResult<Option<TransitionOutcome>> {
        let error = (to == DeploymentStatus::Failed).then_some(line);
        match self.store.transition(deployment_id, to, error).await {
            Ok(outcome) => {
                match &outcome {
                    TransitionOutcome::Applied { from, to } => {
                        PipelineStats::bump(&self.stats.transitions);
                        info!(
                            deployment_id = %deployment_id,
                            from = %from,
                            to = %to,
                            "status transition"
                        );
                    }
                    TransitionOutcome::Unchanged { current } => {
                        debug!(
                            deployment_id = %deployment_id,
                            current = %current,
                            target = %to,
                            "marker ignored"
                        );
                    }
                }
                Ok(Some(outcome))
            }
            Err(ControlError::DeploymentNotFound(_)) => {
                warn!(deployment_id = %deployment_id, "marker for unknown deployment");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Handle one message, retrying transient failures until success or
    /// cancellation. Returns `None` when cancelled before the message was
    /// handled; the caller must not commit past it.
    async fn process_with_retry(
        &self,
        message: &StreamMessage,
        lease: &mut Lease,
        cancel: &CancellationToken,
    ) -> ControlResult<Option<Processed>> {
        let mut delay = Duration::from_millis(self.config.retry_initial_ms.max(1));
        let max_delay = Duration::from_millis(self.config.retry_max_ms.max(1));

        loop {
            match self.process(message).await {
                Ok(processed) => return Ok(Some(processed)),
                Err(e) if e.is_transient() => {
                    PipelineStats::bump(&self.stats.retries);
                    warn!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        retry_in = ?delay,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(max_delay);
                    self.keep_lease(lease).await?;
                }
                Err(e) => {
                    PipelineStats::bump(&self.stats.rejected);
                    error!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "skipping event after store error"
                    );
                    return Ok(Some(Processed::Rejected));
                }
            }
        }
    }

    /// Heartbeat the lease once half its lifetime has passed.
    async fn keep_lease(&self, lease: &mut Lease) -> ControlResult<()> {
        let ttl = self.config.lease_ttl();
        let half = chrono::Duration::from_std(ttl / 2).unwrap_or_else(|_| chrono::Duration::zero());
        if lease.expires_at - Utc::now() <= half {
            *lease = self.stream.heartbeat(lease, ttl).await?;
        }
        Ok(())
    }

    /// Process one batch of the leased partition from the committed position.
    ///
    /// Commits after every handled message, then trims what every consumer
    /// group has moved past. Returns the number of messages committed.
    pub async fn poll_once(
        &self,
        lease: &mut Lease,
        cancel: &CancellationToken,
    ) -> ControlResult<usize> {
        self.keep_lease(lease).await?;

        let from = self.stream.committed(&self.group, lease.partition).await?;
        let batch = self
            .stream
            .fetch(lease.partition, from, self.config.batch_size.max(1))
            .await?;

        let mut committed = 0;
        for message in &batch {
            if cancel.is_cancelled() {
                break;
            }
            if self
                .process_with_retry(message, lease, cancel)
                .await?
                .is_none()
            {
                break;
            }
            self.stream.commit(lease, message.offset + 1).await?;
            committed += 1;
            self.keep_lease(lease).await?;
        }

        if committed > 0 {
            match self.stream.trim(lease.partition).await {
                Ok(0) => {}
                Ok(removed) => {
                    debug!(partition = lease.partition, removed, "trimmed committed messages");
                }
                Err(e) => {
                    warn!(partition = lease.partition, error = %e, "stream trim failed");
                }
            }
        }
        Ok(committed)
    }

    /// Consume every partition until it is empty, with a temporary holder.
    ///
    /// Returns the number of messages committed.
    pub async fn drain(&self) -> ControlResult<usize> {
        let cancel = CancellationToken::new();
        let holder = new_holder();
        let mut total = 0;

        for partition in 0..self.partitions() {
            let Some(mut lease) = self
                .stream
                .acquire_lease(&self.group, partition, &holder, self.config.lease_ttl())
                .await?
            else {
                continue;
            };
            loop {
                let n = self.poll_once(&mut lease, &cancel).await?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            self.stream.release_lease(&lease).await?;
        }
        Ok(total)
    }

    /// Own `partition` and consume it until `cancel` fires.
    ///
    /// Lost leases are re-acquired; transient errors back off and retry.
    pub async fn run_partition(&self, partition: u32, cancel: CancellationToken) -> ControlResult<()> {
        let holder = new_holder();
        let idle = self.config.poll_interval();

        while !cancel.is_cancelled() {
            let acquired = self
                .stream
                .acquire_lease(&self.group, partition, &holder, self.config.lease_ttl())
                .await;
            let mut lease = match acquired {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!(partition, "partition owned elsewhere");
                    sleep_or_cancel(self.config.lease_ttl() / 2, &cancel).await;
                    continue;
                }
                Err(e) if e.is_transient() => {
                    warn!(partition, error = %e, "lease acquisition failed, retrying");
                    sleep_or_cancel(idle, &cancel).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            info!(partition, holder = %holder, "partition lease acquired");

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match self.poll_once(&mut lease, &cancel).await {
                    Ok(0) => sleep_or_cancel(idle, &cancel).await,
                    Ok(n) => debug!(partition, committed = n, "batch committed"),
                    Err(ControlError::Stream(StreamError::LeaseLost { .. })) => {
                        warn!(partition, "partition lease lost");
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(partition, error = %e, "stream unavailable, retrying");
                        sleep_or_cancel(idle, &cancel).await;
                    }
                    Err(e) => return Err(e),
                }
            }

            if cancel.is_cancelled() {
                if let Err(e) = self.stream.release_lease(&lease).await {
                    warn!(partition, error = %e, "failed to release lease on shutdown");
                }
            }
        }

        info!(partition, "ingestion stopped");
        Ok(())
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("group", &self.group)
            .field("markers", &self.markers.rules().len())
            .finish_non_exhaustive()
    }
}

fn new_holder() -> String {
    format!("ingest-{}", ulid::Ulid::new().to_string().to_lowercase())
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(delay) => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::events::MemoryEventStore;
    use crate::store::MemoryStore;
    use crate::stream::MemoryStream;
    use crate::types::{DeploymentRecord, LogEvent, ProjectId};

    struct Harness {
        stream: Arc<MemoryStream>,
        events: Arc<MemoryEventStore>,
        store: Arc<MemoryStore>,
        pipeline: IngestionPipeline,
    }

    fn harness_with(events: Arc<dyn EventStore>, mem_events: Arc<MemoryEventStore>) -> Harness {
        let stream = Arc::new(MemoryStream::new(2));
        let store = Arc::new(MemoryStore::new());
        let config = IngestionConfig {
            retry_initial_ms: 1,
            retry_max_ms: 4,
            ..IngestionConfig::default()
        };
        let pipeline = IngestionPipeline::new(
            Arc::clone(&stream) as Arc<dyn EventStream>,
            events,
            Arc::clone(&store) as Arc<dyn DeploymentStore>,
            LogBroadcaster::new(16),
            config,
            "test",
        );
        Harness {
            stream,
            events: mem_events,
            store,
            pipeline,
        }
    }

    fn harness() -> Harness {
        let events = Arc::new(MemoryEventStore::new());
        harness_with(Arc::clone(&events) as Arc<dyn EventStore>, events)
    }

    async fn deployment(store: &MemoryStore, status: DeploymentStatus) -> DeploymentId {
        let mut record = DeploymentRecord::queued(ProjectId::generate());
        record.status = status;
        store.create_deployment(&record).await.unwrap();
        record.id
    }

    async fn publish(stream: &MemoryStream, deployment: &DeploymentId, log: &str) {
        let payload = json!({
            "PROJECT_ID": "p",
            "DEPLOYMENT_ID": deployment.as_str(),
            "log": log,
        });
        stream
            .publish(deployment.as_str(), payload.to_string().as_bytes())
            .await
            .unwrap();
    }

    async fn status(store: &MemoryStore, id: &DeploymentId) -> DeploymentStatus {
        store.get_deployment(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn markers_drive_the_lifecycle() {
        let h = harness();
        let id = deployment(&h.store, DeploymentStatus::Queued).await;

        publish(&h.stream, &id, "Build started......").await;
        publish(&h.stream, &id, "npm install").await;
        publish(
            &h.stream,
            &id,
            "All files uploaded successfully. Build process complete.",
        )
        .await;

        assert_eq!(h.pipeline.drain().await.unwrap(), 3);
        assert_eq!(status(&h.store, &id).await, DeploymentStatus::Ready);
        assert_eq!(h.events.len().unwrap(), 3);

        let stats = h.pipeline.stats().snapshot();
        assert_eq!(stats.persisted, 3);
        assert_eq!(stats.transitions, 2);
    }

    #[tokio::test]
    async fn failure_marker_records_the_line() {
        let h = harness();
        let id = deployment(&h.store, DeploymentStatus::InProgress).await;
        publish(&h.stream, &id, "Build failed: npm ERR! missing script: build").await;

        h.pipeline.drain().await.unwrap();
        let record = h.store.get_deployment(&id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("Build failed: npm ERR! missing script: build")
        );
    }

    #[tokio::test]
    async fn terminal_deployment_ignores_late_markers() {
        let h = harness();
        let id = deployment(&h.store, DeploymentStatus::Failed).await;
        publish(&h.stream, &id, "All files uploaded successfully.").await;

        h.pipeline.drain().await.unwrap();
        assert_eq!(status(&h.store, &id).await, DeploymentStatus::Failed);
        assert_eq!(h.pipeline.stats().snapshot().transitions, 0);
    }

    #[tokio::test]
    async fn malformed_message_is_skipped_and_committed() {
        let h = harness();
        let id = deployment(&h.store, DeploymentStatus::Queued).await;
        h.stream.publish(id.as_str(), b"{oops").await.unwrap();
        publish(&h.stream, &id, "Build started").await;

        assert_eq!(h.pipeline.drain().await.unwrap(), 2);
        assert_eq!(status(&h.store, &id).await, DeploymentStatus::InProgress);
        assert_eq!(h.pipeline.stats().snapshot().malformed, 1);
        // Nothing left to read.
        assert_eq!(h.pipeline.drain().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn committed_messages_are_trimmed_from_the_stream() {
        let h = harness();
        let id = deployment(&h.store, DeploymentStatus::Queued).await;
        publish(&h.stream, &id, "Build started").await;
        publish(&h.stream, &id, "npm install").await;
        let partition = crate::stream::partition_for(id.as_str(), 2);
        assert_eq!(h.stream.len(partition).await, 2);

        assert_eq!(h.pipeline.drain().await.unwrap(), 2);
        assert_eq!(h.stream.len(partition).await, 0);
        assert_eq!(h.events.len().unwrap(), 2);

        // Offsets keep counting after the trim.
        publish(&h.stream, &id, "npm run build").await;
        assert_eq!(h.pipeline.drain().await.unwrap(), 1);
        assert_eq!(h.stream.committed("test", partition).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn replayed_message_is_absorbed() {
        let h = harness();
        let id = deployment(&h.store, DeploymentStatus::Queued).await;
        publish(&h.stream, &id, "Build started").await;

        let partition = crate::stream::partition_for(id.as_str(), 2);
        let message = h.stream.fetch(partition, 0, 1).await.unwrap().remove(0);

        let first = h.pipeline.process(&message).await.unwrap();
        let second = h.pipeline.process(&message).await.unwrap();

        assert!(matches!(
            first,
            Processed::Stored {
                append: AppendOutcome::Inserted,
                transition: Some(TransitionOutcome::Applied { .. })
            }
        ));
        assert!(matches!(
            second,
            Processed::Stored {
                append: AppendOutcome::Duplicate,
                transition: Some(TransitionOutcome::Unchanged { .. })
            }
        ));
        assert_eq!(h.events.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_deployment_logs_are_still_stored() {
        let h = harness();
        let id = DeploymentId::generate();
        publish(&h.stream, &id, "Build started").await;

        assert_eq!(h.pipeline.drain().await.unwrap(), 1);
        assert_eq!(h.events.len().unwrap(), 1);
    }

    /// Event store that fails transiently a fixed number of times.
    struct Flaky {
        inner: MemoryEventStore,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl EventStore for Flaky {
        async fn ping(&self) -> ControlResult<()> {
            Ok(())
        }

        async fn append(&self, event: &LogEvent) -> ControlResult<AppendOutcome> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ControlError::transient("event store down"));
            }
            self.inner.append(event).await
        }

        async fn list(
            &self,
            deployment_id: &DeploymentId,
            after: Option<u64>,
            limit: usize,
        ) -> ControlResult<Vec<LogEvent>> {
            self.inner.list(deployment_id, after, limit).await
        }

        async fn tail(&self, deployment_id: &DeploymentId, n: usize) -> ControlResult<Vec<LogEvent>> {
            self.inner.tail(deployment_id, n).await
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_before_commit() {
        let flaky = Arc::new(Flaky {
            inner: MemoryEventStore::new(),
            failures_left: AtomicUsize::new(3),
        });
        let h = harness_with(
            Arc::clone(&flaky) as Arc<dyn EventStore>,
            Arc::new(MemoryEventStore::new()),
        );
        let id = deployment(&h.store, DeploymentStatus::Queued).await;
        publish(&h.stream, &id, "Build started").await;

        assert_eq!(h.pipeline.drain().await.unwrap(), 1);
        assert_eq!(flaky.inner.len().unwrap(), 1);
        assert_eq!(h.pipeline.stats().snapshot().retries, 3);
        assert_eq!(status(&h.store, &id).await, DeploymentStatus::InProgress);
    }

    #[tokio::test]
    async fn cancelled_retry_does_not_commit() {
        let flaky = Arc::new(Flaky {
            inner: MemoryEventStore::new(),
            failures_left: AtomicUsize::new(usize::MAX),
        });
        let h = harness_with(
            Arc::clone(&flaky) as Arc<dyn EventStore>,
            Arc::new(MemoryEventStore::new()),
        );
        let id = deployment(&h.store, DeploymentStatus::Queued).await;
        publish(&h.stream, &id, "Build started").await;
        let partition = crate::stream::partition_for(id.as_str(), 2);

        let mut lease = h
            .stream
            .acquire_lease("test", partition, "t", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let committed = h.pipeline.poll_once(&mut lease, &cancel).await.unwrap();
        assert_eq!(committed, 0);
        assert_eq!(h.stream.committed("test", partition).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_partition_consumes_until_cancelled() {
        let h = harness();
        let id = deployment(&h.store, DeploymentStatus::Queued).await;
        publish(&h.stream, &id, "Build started").await;
        let partition = crate::stream::partition_for(id.as_str(), 2);

        let pipeline = Arc::new(h.pipeline);
        let cancel = CancellationToken::new();
        let task = {
            let pipeline = Arc::clone(&pipeline);
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run_partition(partition, cancel).await })
        };

        for _ in 0..100 {
            if status(&h.store, &id).await == DeploymentStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status(&h.store, &id).await, DeploymentStatus::InProgress);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(h.stream.committed("test", partition).await.unwrap(), 1);
    }
}
