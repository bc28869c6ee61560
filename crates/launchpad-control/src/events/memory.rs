//! In-memory event store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, LogEvent};

use super::{AppendOutcome, EventStore};

#[derive(Debug, Default)]
struct Log {
    event_ids: HashSet<String>,
    by_deployment: HashMap<String, BTreeMap<u64, LogEvent>>,
}

/// In-memory event store for tests and single-node runs.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    log: RwLock<Log>,
}

impl MemoryEventStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events.
    pub fn len(&self) -> ControlResult<usize> {
        let log = self
            .log
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        Ok(log.event_ids.len())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn ping(&self) -> ControlResult<()> {
        self.len().map(|_| ())
    }

    async fn append(&self, event: &LogEvent) -> ControlResult<AppendOutcome> {
        let mut log = self
            .log
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if log.event_ids.contains(event.event_id.as_str()) {
            return Ok(AppendOutcome::Duplicate);
        }
        let events = log
            .by_deployment
            .entry(event.deployment_id.as_str().to_owned())
            .or_default();
        if events.contains_key(&event.sequence) {
            return Ok(AppendOutcome::Duplicate);
        }
        events.insert(event.sequence, event.clone());
        log.event_ids.insert(event.event_id.as_str().to_owned());
        Ok(AppendOutcome::Inserted)
    }

    async fn list(
        &self,
        deployment_id: &DeploymentId,
        after: Option<u64>,
        limit: usize,
    ) -> ControlResult<Vec<LogEvent>> {
        let log = self
            .log
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let Some(events) = log.by_deployment.get(deployment_id.as_str()) else {
            return Ok(Vec::new());
        };
        let iter: Box<dyn Iterator<Item = &LogEvent>> = match after {
            Some(after) => Box::new(
                events
                    .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .map(|(_, e)| e),
            ),
            None => Box::new(events.values()),
        };
        Ok(iter.take(limit).cloned().collect())
    }

    async fn tail(&self, deployment_id: &DeploymentId, n: usize) -> ControlResult<Vec<LogEvent>> {
        let log = self
            .log
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let Some(events) = log.by_deployment.get(deployment_id.as_str()) else {
            return Ok(Vec::new());
        };
        let mut tail: Vec<_> = events.values().rev().take(n).cloned().collect();
        tail.reverse();
        Ok(tail)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::EventId;

    fn event(deployment: &DeploymentId, sequence: u64, log: &str) -> LogEvent {
        LogEvent {
            event_id: EventId::generate(),
            deployment_id: deployment.clone(),
            sequence,
            timestamp: Utc::now(),
            log: log.to_owned(),
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_sequence_is_absorbed() {
        let store = MemoryEventStore::new();
        let dep = DeploymentId::generate();

        assert_eq!(
            store.append(&event(&dep, 1, "a")).await.unwrap(),
            AppendOutcome::Inserted
        );
        // Fresh event id, same (deployment, sequence).
        assert_eq!(
            store.append(&event(&dep, 1, "a")).await.unwrap(),
            AppendOutcome::Duplicate
        );
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_absorbed() {
        let store = MemoryEventStore::new();
        let dep = DeploymentId::generate();
        let first = event(&dep, 1, "a");
        let replay = LogEvent {
            sequence: 2,
            ..first.clone()
        };

        store.append(&first).await.unwrap();
        assert_eq!(
            store.append(&replay).await.unwrap(),
            AppendOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn list_is_sorted_by_sequence() {
        let store = MemoryEventStore::new();
        let dep = DeploymentId::generate();
        for seq in [3, 1, 4, 2, 5] {
            store.append(&event(&dep, seq, "x")).await.unwrap();
        }

        let all = store.list(&dep, None, 100).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );

        let page = store.list(&dep, Some(2), 2).await.unwrap();
        assert_eq!(
            page.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![3, 4]
        );

        let tail = store.tail(&dep, 2).await.unwrap();
        assert_eq!(
            tail.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![4, 5]
        );
    }

    #[tokio::test]
    async fn unknown_deployment_has_no_events() {
        let store = MemoryEventStore::new();
        let dep = DeploymentId::generate();
        assert!(store.list(&dep, None, 10).await.unwrap().is_empty());
        assert!(store.tail(&dep, 10).await.unwrap().is_empty());
    }
}
