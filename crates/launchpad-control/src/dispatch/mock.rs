//! Scripted scheduler for tests and local runs.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};

use super::{LaunchRequest, TaskAck, TaskScheduler};

/// How [`MockScheduler`] answers launch requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MockSchedulerMode {
    /// Accept every launch.
    #[default]
    Accept,
    /// Reject every launch with this reason.
    Reject(String),
    /// Never answer within this delay.
    Hang(Duration),
}

/// Scheduler that records every request and answers per its mode.
#[derive(Debug, Default)]
pub struct MockScheduler {
    mode: RwLock<MockSchedulerMode>,
    launched: RwLock<Vec<LaunchRequest>>,
}

impl MockScheduler {
    /// Create a scheduler answering with `mode`.
    #[must_use]
    pub fn new(mode: MockSchedulerMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            launched: RwLock::new(Vec::new()),
        }
    }

    /// A scheduler that rejects every launch.
    #[must_use]
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self::new(MockSchedulerMode::Reject(reason.into()))
    }

    /// Change how subsequent launches are answered.
    pub fn set_mode(&self, mode: MockSchedulerMode) -> ControlResult<()> {
        *self
            .mode
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))? = mode;
        Ok(())
    }

    /// Every request received so far, in order.
    pub fn launched(&self) -> ControlResult<Vec<LaunchRequest>> {
        Ok(self
            .launched
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .clone())
    }
}

#[async_trait]
impl TaskScheduler for MockScheduler {
    async fn launch(&self, request: &LaunchRequest) -> ControlResult<TaskAck> {
        self.launched
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .push(request.clone());

        let mode = self
            .mode
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .clone();

        match mode {
            MockSchedulerMode::Accept => Ok(TaskAck {
                task_id: Some(format!("task-{}", ulid::Ulid::new().to_string().to_lowercase())),
            }),
            MockSchedulerMode::Reject(reason) => Err(ControlError::scheduler(reason)),
            MockSchedulerMode::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Err(ControlError::scheduler("mock scheduler woke up"))
            }
        }
    }
}
