//! Admission: deciding whether a project may start a new deployment.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AdmissionConfig;
use crate::dispatch::TaskDispatcher;
use crate::error::{ControlError, ControlResult};
use crate::state::Deployment;
use crate::store::DeploymentStore;
use crate::types::{DeploymentRecord, Project, ProjectId, User};

/// Admits deployment requests and hands them to the dispatcher.
///
/// Creation and dispatch are two sequenced, awaited steps: the returned
/// record reflects the dispatch outcome the caller can already observe.
pub struct AdmissionController {
    store: Arc<dyn DeploymentStore>,
    dispatcher: Arc<TaskDispatcher>,
    policy: AdmissionConfig,
}

impl AdmissionController {
    /// Create a new admission controller.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        dispatcher: Arc<TaskDispatcher>,
        policy: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            policy,
        }
    }

    /// Request a new deployment of `project_id` on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// - `ProjectNotFound` for an unknown project
    /// - `Forbidden` when ownership is enforced and the caller is not the owner
    /// - `DeploymentInFlight` when the project already has a QUEUED or
    ///   IN_PROGRESS deployment
    /// - `DispatchFailure` when the scheduler rejected the build task; the
    ///   deployment is FAILED
    pub async fn request_deployment(
        &self,
        project_id: &ProjectId,
        caller: Option<&User>,
    ) -> ControlResult<DeploymentRecord> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| ControlError::ProjectNotFound(project_id.to_string()))?;

        let project = self.authorise(project, caller).await?;
        self.admit(&project).await
    }

    /// Request a deployment on behalf of an already-authenticated trigger,
    /// such as a verified webhook. Ownership is not checked.
    pub async fn request_trusted(&self, project: &Project) -> ControlResult<DeploymentRecord> {
        self.admit(project).await
    }

    async fn admit(&self, project: &Project) -> ControlResult<DeploymentRecord> {
        let record = DeploymentRecord::queued(project.id.clone());
        if let Err(e) = self.store.create_deployment(&record).await {
            if e.is_conflict() {
                warn!(project = %project.id, "deployment already in flight");
            }
            return Err(e);
        }
        info!(
            deployment_id = %record.id,
            project = %project.id,
            "deployment admitted"
        );

        // The dispatch runs on its own task so a dropped request cannot leave
        // the row QUEUED with no launch in progress.
        let dispatcher = Arc::clone(&self.dispatcher);
        let project = project.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(Deployment::admit(record), &project)
                .await
        })
        .await
        .map_err(|e| ControlError::internal(format!("dispatch task failed: {e}")))?
    }

    async fn authorise(&self, project: Project, caller: Option<&User>) -> ControlResult<Project> {
        if !self.policy.enforce_ownership {
            return Ok(project);
        }

        let Some(caller) = caller else {
            return Err(ControlError::Forbidden(format!(
                "project {} requires an authenticated caller",
                project.id
            )));
        };

        let project = if project.owner_id.is_none() {
            let claimed = self.store.claim_project(&project.id, &caller.id).await?;
            info!(project = %claimed.id, owner = %caller.id, "project ownership backfilled");
            claimed
        } else {
            project
        };

        if project.owner_id.as_ref() != Some(&caller.id) {
            return Err(ControlError::Forbidden(format!(
                "{} does not own project {}",
                caller.email, project.id
            )));
        }
        Ok(project)
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
