//! In-process fan-out of freshly persisted log events.

use futures::stream::{self, Stream};
use tokio::sync::broadcast;

use crate::types::{DeploymentId, LogEvent};

/// Broadcasts every persisted log event to live subscribers.
///
/// Slow subscribers that fall more than `capacity` events behind skip the
/// missed events; the durable copy is always in the event store.
#[derive(Debug, Clone)]
pub struct LogBroadcaster {
    tx: broadcast::Sender<LogEvent>,
}

impl LogBroadcaster {
    /// Create a broadcaster buffering up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. A no-op when nobody is listening.
    pub fn publish(&self, event: &LogEvent) {
        let _ = self.tx.send(event.clone());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribe to the events of one deployment.
    ///
    /// The stream ends when the broadcaster is dropped.
    pub fn subscribe(&self, deployment_id: DeploymentId) -> impl Stream<Item = LogEvent> + Send {
        let rx = self.tx.subscribe();
        stream::unfold((rx, deployment_id), |(mut rx, deployment_id)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.deployment_id == deployment_id => {
                        return Some((event, (rx, deployment_id)));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            deployment_id = %deployment_id,
                            skipped,
                            "live log subscriber lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}
