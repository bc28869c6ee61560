//! Project registration and lookup.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::AdmissionConfig;
use crate::error::{ControlError, ControlResult};
use crate::slug;
use crate::store::DeploymentStore;
use crate::types::{Project, ProjectId, User};

const MIN_NAME_LEN: usize = 3;
const SLUG_ATTEMPTS: usize = 8;
const DEFAULT_BRANCH: &str = "main";

/// Request body for creating a project.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    /// Unique project name.
    pub name: String,
    /// Git repository the build worker clones.
    pub repo_url: String,
    /// Branch whose pushes trigger deployments. Defaults to `main`.
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Creates and looks up projects.
pub struct ProjectService {
    store: Arc<dyn DeploymentStore>,
    policy: AdmissionConfig,
}

impl ProjectService {
    /// Create a new project service.
    pub fn new(store: Arc<dyn DeploymentStore>, policy: AdmissionConfig) -> Self {
        Self { store, policy }
    }

    /// Register a new project owned by `owner`, with a fresh subdomain slug.
    pub async fn create(&self, request: CreateProject, owner: Option<&User>) -> ControlResult<Project> {
        let name = request.name.trim();
        if name.chars().count() < MIN_NAME_LEN {
            return Err(ControlError::validation(format!(
                "project name must be at least {MIN_NAME_LEN} characters"
            )));
        }
        let repo_url = request.repo_url.trim();
        if repo_url.is_empty() {
            return Err(ControlError::validation("repository URL is required"));
        }
        let default_branch = request
            .default_branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BRANCH);

        if self.store.get_project_by_name(name).await?.is_some() {
            return Err(ControlError::ProjectExists(name.to_owned()));
        }

        let mut project = Project {
            id: ProjectId::generate(),
            name: name.to_owned(),
            repo_url: repo_url.to_owned(),
            slug: slug::generate(),
            default_branch: default_branch.to_owned(),
            owner_id: owner.map(|u| u.id.clone()),
            created_at: Utc::now(),
        };

        for _ in 0..SLUG_ATTEMPTS {
            match self.store.insert_project(&project).await {
                Ok(()) => {
                    info!(
                        project = %project.id,
                        name = %project.name,
                        slug = %project.slug,
                        "project created"
                    );
                    return Ok(project);
                }
                Err(ControlError::SlugTaken(taken)) => {
                    debug!(slug = %taken, "slug collision, regenerating");
                    project.slug = slug::generate();
                }
                Err(e) => return Err(e),
            }
        }
        Err(ControlError::internal("could not allocate a unique slug"))
    }

    /// Projects visible to `caller`, newest first.
    ///
    /// An identified caller sees the projects they own. An anonymous caller
    /// sees everything unless ownership is enforced.
    pub async fn list(&self, caller: Option<&User>) -> ControlResult<Vec<Project>> {
        match caller {
            Some(user) => self.store.list_projects(Some(&user.id)).await,
            None if self.policy.enforce_ownership => Err(ControlError::Forbidden(
                "listing projects requires an authenticated caller".to_owned(),
            )),
            None => self.store.list_projects(None).await,
        }
    }

    /// Look up a project.
    pub async fn get(&self, id: &ProjectId) -> ControlResult<Project> {
        self.store
            .get_project(id)
            .await?
            .ok_or_else(|| ControlError::ProjectNotFound(id.to_string()))
    }
}

impl std::fmt::Debug for ProjectService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
