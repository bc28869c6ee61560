//! Project endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::ControlError;
use crate::projects::CreateProject;
use crate::store::DeploymentFilter;
use crate::types::{DeploymentRecord, DeploymentStatus, Project, ProjectId};

use super::{ApiError, AppState, Caller};

/// Query parameters for listing a project's deployments.
#[derive(Debug, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Only deployments in this status.
    pub status: Option<String>,
}

/// Register a project.
pub async fn create_project(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateProject>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = state.projects.create(request, caller.user()).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// List the caller's projects.
pub async fn list_projects(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.projects.list(caller.user()).await?))
}

/// Get a project by ID.
pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.projects.get(&ProjectId::new(id)).await?))
}

/// List a project's deployments, newest first.
pub async fn list_project_deployments(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<DeploymentRecord>>, ApiError> {
    let project = state.projects.get(&ProjectId::new(id)).await?;

    let mut filter = DeploymentFilter::new().with_project(project.id);
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }
    if let Some(status) = query.status.as_deref() {
        let status = status
            .parse::<DeploymentStatus>()
            .map_err(ControlError::Validation)?;
        filter = filter.with_status(status);
    }

    Ok(Json(state.store.list_deployments(&filter).await?))
}
