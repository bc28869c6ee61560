//! Deployment storage backends.
//!
//! The deployment store owns users, projects and deployment rows. Every status
//! write goes through it: automatic transitions as compare-and-set writes
//! ([`DeploymentStore::transition`], [`DeploymentStore::fail_stale`]) and the
//! administrative override ([`DeploymentStore::set_status`]). The PostgreSQL
//! implementation is the production backend; the in-memory one backs tests
//! and single-node runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ControlResult;
use crate::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, Project, ProjectId, TransitionOutcome,
    User, UserId,
};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by project ID.
    pub project_id: Option<ProjectId>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            project_id: None,
            status: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by project ID.
    #[must_use]
    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Backend for users, projects and deployment records.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Check the backend is reachable.
    async fn ping(&self) -> ControlResult<()>;

    /// Return the user with this email, creating it on first sight.
    async fn upsert_user(&self, email: &str) -> ControlResult<User>;

    /// Insert a new project.
    ///
    /// Fails with `ProjectExists` on a duplicate name and `SlugTaken` on a
    /// duplicate slug.
    async fn insert_project(&self, project: &Project) -> ControlResult<()>;

    /// Get a project by ID.
    async fn get_project(&self, id: &ProjectId) -> ControlResult<Option<Project>>;

    /// Get a project by its unique name.
    async fn get_project_by_name(&self, name: &str) -> ControlResult<Option<Project>>;

    /// List projects, optionally only those owned by `owner`. Newest first.
    async fn list_projects(&self, owner: Option<&UserId>) -> ControlResult<Vec<Project>>;

    /// Set the owner of a project that has none.
    ///
    /// Returns the project as stored afterwards; if it already had an owner
    /// that owner is kept.
    async fn claim_project(&self, id: &ProjectId, owner: &UserId) -> ControlResult<Project>;

    /// Insert a freshly admitted deployment.
    ///
    /// Fails with `DeploymentInFlight` if the project already has a QUEUED or
    /// IN_PROGRESS deployment. Two concurrent calls for one project resolve to
    /// exactly one success.
    async fn create_deployment(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Get a deployment by ID.
    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// List deployments matching the filter. Newest first.
    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>>;

    /// Apply an automatic transition to `to`.
    ///
    /// The write happens only when the current status is one of
    /// [`allowed_sources`](crate::state::allowed_sources)`(to)`; otherwise the
    /// deployment is untouched and `Unchanged` reports its status. `error`
    /// replaces the stored error message when the write applies.
    async fn transition(
        &self,
        id: &DeploymentId,
        to: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<TransitionOutcome>;

    /// Administrative override: set any status.
    ///
    /// Still fails with `DeploymentInFlight` when it would give the project a
    /// second QUEUED or IN_PROGRESS deployment.
    async fn set_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
    ) -> ControlResult<DeploymentRecord>;

    /// Fail every QUEUED or IN_PROGRESS deployment created before `cutoff`.
    ///
    /// Returns the IDs that were failed.
    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> ControlResult<Vec<DeploymentId>>;

    /// Number of deployments per status. Statuses with no rows are omitted.
    async fn count_by_status(&self) -> ControlResult<Vec<(DeploymentStatus, u64)>>;
}
