//! Log event storage and live fan-out.
//!
//! The event store is append-only and keyed by deployment. Appends are
//! idempotent: a second append with the same event id, or the same
//! `(deployment_id, sequence)` pair, is reported as a duplicate instead of
//! failing, so redelivered stream messages are absorbed.

mod broadcaster;
mod memory;
mod postgres;

pub use broadcaster::LogBroadcaster;
pub use memory::MemoryEventStore;
pub use postgres::PostgresEventStore;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{DeploymentId, LogEvent};

/// Result of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was stored.
    Inserted,
    /// An event with the same id or `(deployment, sequence)` already exists.
    Duplicate,
}

/// Backend for log events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Check the backend is reachable.
    async fn ping(&self) -> ControlResult<()>;

    /// Store an event unless it is already present.
    async fn append(&self, event: &LogEvent) -> ControlResult<AppendOutcome>;

    /// Events of a deployment in ascending sequence order, starting after
    /// `after` when given.
    async fn list(
        &self,
        deployment_id: &DeploymentId,
        after: Option<u64>,
        limit: usize,
    ) -> ControlResult<Vec<LogEvent>>;

    /// The last `n` events of a deployment, in ascending sequence order.
    async fn tail(&self, deployment_id: &DeploymentId, n: usize) -> ControlResult<Vec<LogEvent>>;
}
