//! Launching build tasks on the container task scheduler.
//!
//! The build worker learns what to build and where to report only through
//! the three environment values of its launch request: `REPO_URL`,
//! `PROJECT_SLUG` and `DEPLOYMENT_ID`.

mod client;
mod dispatcher;
mod mock;

pub use client::HttpTaskScheduler;
pub use dispatcher::TaskDispatcher;
pub use mock::{MockScheduler, MockSchedulerMode};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::error::ControlResult;
use crate::types::{DeploymentId, Project};

/// Environment key carrying the repository URL.
pub const ENV_REPO_URL: &str = "REPO_URL";
/// Environment key carrying the project's subdomain slug.
pub const ENV_PROJECT_SLUG: &str = "PROJECT_SLUG";
/// Environment key carrying the deployment id the worker reports under.
pub const ENV_DEPLOYMENT_ID: &str = "DEPLOYMENT_ID";

/// Request to start one build task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Opaque task definition the scheduler runs.
    pub task_definition: String,
    /// Cluster to run it in.
    pub cluster: String,
    /// Environment handed to the task.
    pub environment: BTreeMap<String, String>,
}

impl LaunchRequest {
    /// Build the launch request for a deployment of `project`.
    #[must_use]
    pub fn for_deployment(
        config: &SchedulerConfig,
        project: &Project,
        deployment_id: &DeploymentId,
    ) -> Self {
        let environment = BTreeMap::from([
            (ENV_REPO_URL.to_owned(), project.repo_url.clone()),
            (ENV_PROJECT_SLUG.to_owned(), project.slug.clone()),
            (ENV_DEPLOYMENT_ID.to_owned(), deployment_id.to_string()),
        ]);
        Self {
            task_definition: config.task_definition.clone(),
            cluster: config.cluster.clone(),
            environment,
        }
    }

    /// The deployment id carried in the environment.
    #[must_use]
    pub fn deployment_id(&self) -> Option<&str> {
        self.environment.get(ENV_DEPLOYMENT_ID).map(String::as_str)
    }
}

/// Scheduler acknowledgement of an accepted launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAck {
    /// Scheduler-assigned task identifier, if it returns one.
    #[serde(default)]
    pub task_id: Option<String>,
}

/// A container task scheduler that can start build tasks.
///
/// `launch` returns once the scheduler has accepted or rejected the task; any
/// error is a rejection.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Ask the scheduler to start a task.
    async fn launch(&self, request: &LaunchRequest) -> ControlResult<TaskAck>;
}
