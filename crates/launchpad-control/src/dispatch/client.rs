//! HTTP client for the task scheduler.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::SchedulerConfig;
use crate::error::{ControlError, ControlResult};

use super::{LaunchRequest, TaskAck, TaskScheduler};

/// Launches build tasks by POSTing to `{url}/tasks`.
///
/// Any 2xx response is an acceptance. A body that is not a [`TaskAck`] is
/// tolerated; the task id is then unknown.
#[derive(Debug, Clone)]
pub struct HttpTaskScheduler {
    client: Client,
    base_url: String,
}

impl HttpTaskScheduler {
    /// Create a new scheduler client from configuration.
    pub fn new(config: &SchedulerConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }

    /// The endpoint launch requests are sent to.
    #[must_use]
    pub fn tasks_url(&self) -> String {
        format!("{}/tasks", self.base_url)
    }
}

#[async_trait]
impl TaskScheduler for HttpTaskScheduler {
    async fn launch(&self, request: &LaunchRequest) -> ControlResult<TaskAck> {
        let response = self
            .client
            .post(self.tasks_url())
            .json(request)
            .send()
            .await
            .map_err(ControlError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::scheduler(format!(
                "launch rejected: {status}: {}",
                body.trim()
            )));
        }

        let body = response.bytes().await.map_err(ControlError::Http)?;
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }
}
