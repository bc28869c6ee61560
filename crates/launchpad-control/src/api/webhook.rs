//! Push webhook endpoint.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;

use crate::webhook::{WebhookOutcome, EVENT_HEADER, SIGNATURE_HEADER};

use super::{ApiError, AppState};

/// Query parameters of the webhook URL.
#[derive(Debug, Default, Deserialize)]
pub struct PushQuery {
    /// Name of the project to deploy.
    pub project: Option<String>,
}

/// Receive a push delivery.
///
/// Verified deliveries that need no action still answer 200, so senders
/// learn nothing about which projects exist.
pub async fn push(
    State(state): State<AppState>,
    Query(query): Query<PushQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookOutcome>), ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let outcome = state
        .webhook
        .handle_push(
            &body,
            header(SIGNATURE_HEADER),
            header(EVENT_HEADER),
            query.project.as_deref(),
        )
        .await?;

    let status = match outcome {
        WebhookOutcome::Deployed { .. } => StatusCode::CREATED,
        WebhookOutcome::Ignored { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}
