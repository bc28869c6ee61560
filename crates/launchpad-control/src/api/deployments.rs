//! Deployment endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus, ProjectId};

use super::{ApiError, AppState, Caller};

/// Request to deploy a project.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    /// Project to deploy.
    pub project_id: String,
}

/// Manual status override.
#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    /// New status, e.g. `FAILED`.
    pub status: String,
}

/// A deployment as returned by the API.
#[derive(Debug, Serialize)]
pub struct DeploymentView {
    /// The stored record.
    #[serde(flatten)]
    pub record: DeploymentRecord,
    /// Most recent log lines, included once the deployment has FAILED.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_logs: Vec<String>,
}

impl DeploymentView {
    pub(super) async fn load(state: &AppState, record: DeploymentRecord) -> ControlResult<Self> {
        let recent_logs = if record.status == DeploymentStatus::Failed {
            state
                .events
                .tail(&record.id, state.api.failure_tail_lines)
                .await?
                .into_iter()
                .map(|event| event.log)
                .collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            record,
            recent_logs,
        })
    }
}

/// Request a new deployment.
pub async fn create_deployment(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<DeploymentView>), ApiError> {
    let project_id = ProjectId::new(request.project_id);
    info!(project = %project_id, "deployment requested via API");

    let record = state
        .admission
        .request_deployment(&project_id, caller.user())
        .await?;
    let view = DeploymentView::load(&state, record).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Get a deployment by ID.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentView>, ApiError> {
    let id = DeploymentId::new(id);
    let record = state
        .store
        .get_deployment(&id)
        .await?
        .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
    Ok(Json(DeploymentView::load(&state, record).await?))
}

/// Overwrite a deployment's status.
pub async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SetStatusRequest>,
) -> Result<Json<DeploymentView>, ApiError> {
    let id = DeploymentId::new(id);
    let status = request
        .status
        .parse::<DeploymentStatus>()
        .map_err(ControlError::Validation)?;

    let record = state.store.set_status(&id, status).await?;
    info!(deployment_id = %id, status = %status, "status overridden via API");
    Ok(Json(DeploymentView::load(&state, record).await?))
}
