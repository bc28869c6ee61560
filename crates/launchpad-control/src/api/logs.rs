//! Log endpoints: ordered retrieval, live streaming and worker ingress.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::ingest::WorkerMessage;
use crate::types::{DeploymentId, LogEvent};

use super::{ApiError, AppState};

const DEFAULT_LIMIT: usize = 1000;
const MAX_LIMIT: usize = 5000;

/// Query parameters for log retrieval.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Only events with a sequence greater than this.
    pub after: Option<u64>,
    /// Maximum number of events.
    pub limit: Option<usize>,
}

/// Where an ingested message landed.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Stream partition.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
}

/// Logs of a deployment in sequence order.
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogEvent>>, ApiError> {
    let id = DeploymentId::new(id);
    if state.store.get_deployment(&id).await?.is_none() {
        return Err(ControlError::DeploymentNotFound(id.to_string()).into());
    }

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.events.list(&id, query.after, limit).await?))
}

/// Follow a deployment's logs as server-sent events.
///
/// Only lines persisted after the subscription are sent; clients fetch the
/// backlog from the logs endpoint first.
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = DeploymentId::new(id);
    if state.store.get_deployment(&id).await?.is_none() {
        return Err(ControlError::DeploymentNotFound(id.to_string()).into());
    }
    debug!(deployment_id = %id, "live log subscriber attached");

    let events = state.broadcaster.subscribe(id).map(|event| {
        let sse = Event::default()
            .event("log")
            .id(event.sequence.to_string());
        Ok(sse.json_data(&event).unwrap_or_else(|e| {
            warn!(error = %e, "failed to encode log event");
            Event::default().comment("encode error")
        }))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Append a raw worker message to the event stream.
///
/// The payload is validated before it is published so malformed lines are
/// rejected at the edge instead of being dropped by the pipeline.
pub async fn ingest_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let message = WorkerMessage::parse(&body)?;
    let appended = state
        .stream
        .publish(&message.deployment_id, &body)
        .await
        .map_err(ControlError::from)?;

    debug!(
        deployment_id = %message.deployment_id,
        partition = appended.partition,
        offset = appended.offset,
        "worker message appended"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            partition: appended.partition,
            offset: appended.offset,
        }),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;

    use super::super::tests::{get, send, send_json, test_app, TestApp};
    use super::*;
    use crate::projects::CreateProject;
    use crate::types::DeploymentStatus;

    async fn running_deployment(app: &TestApp) -> DeploymentId {
        let project = app
            .state
            .projects
            .create(
                CreateProject {
                    name: "portfolio".to_owned(),
                    repo_url: "https://git.example.com/portfolio.git".to_owned(),
                    default_branch: None,
                },
                None,
            )
            .await
            .unwrap();
        app.state
            .admission
            .request_deployment(&project.id, None)
            .await
            .unwrap()
            .id
    }

    fn ingest(body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/events")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn ingested_lines_come_back_in_order() {
        let app = test_app();
        let id = running_deployment(&app).await;

        // Delivered out of order at the transport layer.
        for sequence in [3_u64, 1, 2] {
            let (status, _) = send_json(
                &app,
                ingest(&json!({
                    "PROJECT_ID": "p",
                    "DEPLOYMENT_ID": id,
                    "log": format!("line {sequence}"),
                    "sequence": sequence,
                })),
            )
            .await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }
        app.pipeline.drain().await.unwrap();

        let (status, body) = send_json(&app, get(&format!("/deployments/{id}/logs"))).await;
        assert_eq!(status, StatusCode::OK);
        let lines: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["log"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(lines, vec!["line 1", "line 2", "line 3"]);

        let (_, body) = send_json(&app, get(&format!("/deployments/{id}/logs?after=2"))).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ingested_marker_completes_deployment() {
        let app = test_app();
        let id = running_deployment(&app).await;

        send_json(
            &app,
            ingest(&json!({
                "PROJECT_ID": "p",
                "DEPLOYMENT_ID": id,
                "log": "All files uploaded successfully. Build process complete.",
            })),
        )
        .await;
        app.pipeline.drain().await.unwrap();

        let (_, body) = send_json(&app, get(&format!("/deployments/{id}"))).await;
        assert_eq!(body["status"], DeploymentStatus::Ready.as_str());
    }

    #[tokio::test]
    async fn malformed_ingest_is_rejected() {
        let app = test_app();
        let (status, _) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/events")
                .body(Body::from("{\"log\": 1}"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(app.stream.len(0).await + app.stream.len(1).await, 0);
    }

    #[tokio::test]
    async fn logs_of_unknown_deployment_are_not_found() {
        let app = test_app();
        let (status, _) = send(&app, get("/deployments/missing/logs")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, get("/deployments/missing/logs/stream")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn live_stream_is_event_stream() {
        let app = test_app();
        let id = running_deployment(&app).await;

        let response = tower::ServiceExt::oneshot(
            super::super::router(app.state.clone()),
            get(&format!("/deployments/{id}/logs/stream")),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
    }
}
