//! The task dispatcher: launch, then reconcile the deployment row.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::error::{ControlError, ControlResult};
use crate::state::{Deployment, Queued};
use crate::store::DeploymentStore;
use crate::types::{DeploymentRecord, Project, TransitionOutcome};

use super::{LaunchRequest, TaskScheduler};

/// Launches build tasks for admitted deployments.
///
/// Acceptance moves the deployment to IN_PROGRESS. Rejection, a transport
/// error or an elapsed timeout moves it to FAILED and is returned as
/// [`ControlError::DispatchFailure`]. There is no automatic retry; a retry is
/// a new deployment request.
pub struct TaskDispatcher {
    scheduler: Arc<dyn TaskScheduler>,
    store: Arc<dyn DeploymentStore>,
    config: SchedulerConfig,
}

impl TaskDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        store: Arc<dyn DeploymentStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            scheduler,
            store,
            config,
        }
    }

    /// Upper bound on one launch call.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Launch the build task for `deployment` and persist the outcome.
    ///
    /// Returns the deployment as stored after the launch.
    pub async fn dispatch(
        &self,
        deployment: Deployment<Queued>,
        project: &Project,
    ) -> ControlResult<DeploymentRecord> {
        let request = LaunchRequest::for_deployment(&self.config, project, deployment.id());
        let launched = tokio::time::timeout(self.timeout(), self.scheduler.launch(&request)).await;

        let failure = match launched {
            Ok(Ok(ack)) => {
                let started = deployment.start();
                info!(
                    deployment_id = %started.id(),
                    project = %project.id,
                    task_id = ack.task_id.as_deref().unwrap_or("-"),
                    "build task launched"
                );
                return self.persist_start(started.into_record()).await;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("scheduler did not answer within {:?}", self.timeout()),
        };

        let failed = deployment.fail(failure.clone());
        error!(
            deployment_id = %failed.id(),
            project = %project.id,
            error = %failure,
            "build task launch failed"
        );

        let record = failed.into_record();
        self.store
            .transition(&record.id, record.status, record.error.as_deref())
            .await?;

        Err(ControlError::DispatchFailure {
            deployment_id: record.id,
            reason: failure,
        })
    }

    async fn persist_start(&self, record: DeploymentRecord) -> ControlResult<DeploymentRecord> {
        let outcome = self
            .store
            .transition(&record.id, record.status, None)
            .await?;
        if let TransitionOutcome::Unchanged { current } = outcome {
            // The worker's own start marker, the reaper or an override got there first.
            debug!(
                deployment_id = %record.id,
                current = %current,
                "start after launch was a no-op"
            );
        }

        self.store
            .get_deployment(&record.id)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(record.id.to_string()))
    }
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("timeout", &self.timeout())
            .finish_non_exhaustive()
    }
}
