//! HTTP API for the control plane.
//!
//! Provides endpoints for:
//! - Project registration and lookup
//! - Deployment requests, queries and the manual status override
//! - Log retrieval, live log streaming and log ingress
//! - The git push webhook
//! - Health, readiness and Prometheus metrics

mod deployments;
mod logs;
mod projects;
mod webhook;

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::{header::CONTENT_TYPE, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::admission::AdmissionController;
use crate::config::ApiConfig;
use crate::error::ControlError;
use crate::events::{EventStore, LogBroadcaster};
use crate::ingest::PipelineStats;
use crate::projects::ProjectService;
use crate::store::DeploymentStore;
use crate::stream::EventStream;
use crate::types::{DeploymentStatus, User};
use crate::webhook::WebhookTrigger;

pub use deployments::{CreateDeploymentRequest, DeploymentView, SetStatusRequest};
pub use logs::{IngestResponse, LogsQuery};

/// Header identifying the caller, set by the UI after authentication.
pub const USER_HEADER: &str = "x-user-email";

/// Shared application state for the API.
#[derive(Clone)]
pub struct AppState {
    /// Deployment store.
    pub store: Arc<dyn DeploymentStore>,
    /// Event store for log retrieval.
    pub events: Arc<dyn EventStore>,
    /// Event stream for log ingress.
    pub stream: Arc<dyn EventStream>,
    /// Live log fan-out.
    pub broadcaster: LogBroadcaster,
    /// Admission controller for deployment requests.
    pub admission: Arc<AdmissionController>,
    /// Project registration.
    pub projects: Arc<ProjectService>,
    /// Push webhook trigger.
    pub webhook: Arc<WebhookTrigger>,
    /// Ingestion counters for the metrics endpoint.
    pub stats: Arc<PipelineStats>,
    /// Presentation settings.
    pub api: ApiConfig,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        // Projects
        .route(
            "/projects",
            post(projects::create_project).get(projects::list_projects),
        )
        .route("/projects/{id}", get(projects::get_project))
        .route(
            "/projects/{id}/deployments",
            get(projects::list_project_deployments),
        )
        // Deployments
        .route("/deployments", post(deployments::create_deployment))
        .route("/deployments/{id}", get(deployments::get_deployment))
        .route("/deployments/{id}/status", put(deployments::set_status))
        // Logs
        .route("/deployments/{id}/logs", get(logs::get_logs))
        .route("/deployments/{id}/logs/stream", get(logs::stream_logs))
        .route("/events", post(logs::ingest_event))
        // Webhooks
        .route("/webhooks/push", post(webhook::push))
        .with_state(state)
}

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl ApiError {
    const fn status_code(&self) -> StatusCode {
        match &self.0 {
            ControlError::ProjectNotFound(_) | ControlError::DeploymentNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ControlError::DeploymentInFlight { .. } | ControlError::ProjectExists(_) => {
                StatusCode::CONFLICT
            }
            ControlError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ControlError::Forbidden(_) => StatusCode::FORBIDDEN,
            ControlError::Validation(_) | ControlError::MalformedEvent(_) => {
                StatusCode::BAD_REQUEST
            }
            ControlError::DispatchFailure { .. } | ControlError::Scheduler(_) => {
                StatusCode::BAD_GATEWAY
            }
            ControlError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_transient() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            self.status_code()
        };

        let message = if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            error!(error = %self.0, "request failed");
            // Hide internal details
            if status == StatusCode::SERVICE_UNAVAILABLE {
                "Service temporarily unavailable".to_owned()
            } else {
                "Internal server error".to_owned()
            }
        } else {
            self.0.to_string()
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// The caller of a request, if identified.
///
/// The first request carrying a given email creates the user.
#[derive(Debug, Clone)]
pub struct Caller(pub Option<User>);

impl Caller {
    /// The identified user.
    #[must_use]
    pub const fn user(&self) -> Option<&User> {
        self.0.as_ref()
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let email = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match email {
            Some(email) => Ok(Self(Some(state.store.upsert_user(email).await?))),
            None => Ok(Self(None)),
        }
    }
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let store = state.store.ping().await;
    let events = state.events.ping().await;

    match (store, events) {
        (Ok(()), Ok(())) => (StatusCode::OK, Json(ReadyResponse { ready: true })),
        (store, events) => {
            if let Err(e) = store.and(events) {
                error!(error = %e, "readiness check failed");
            }
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse { ready: false }),
            )
        }
    }
}

/// Metrics endpoint.
async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let counts = state.store.count_by_status().await?;
    let mut output = String::new();

    output.push_str("# HELP launchpad_deployments Number of deployments by status\n");
    output.push_str("# TYPE launchpad_deployments gauge\n");
    for status in DeploymentStatus::ALL {
        let count = counts
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n);
        let _ = writeln!(
            output,
            "launchpad_deployments{{status=\"{status}\"}} {count}"
        );
    }

    let stats = state.stats.snapshot();
    output.push_str("# HELP launchpad_ingest_messages_total Stream messages by outcome\n");
    output.push_str("# TYPE launchpad_ingest_messages_total counter\n");
    for (outcome, value) in [
        ("received", stats.received),
        ("persisted", stats.persisted),
        ("duplicate", stats.duplicates),
        ("malformed", stats.malformed),
        ("rejected", stats.rejected),
    ] {
        let _ = writeln!(
            output,
            "launchpad_ingest_messages_total{{outcome=\"{outcome}\"}} {value}"
        );
    }
    output.push_str("# HELP launchpad_ingest_transitions_total Status transitions applied\n");
    output.push_str("# TYPE launchpad_ingest_transitions_total counter\n");
    let _ = writeln!(
        output,
        "launchpad_ingest_transitions_total {}",
        stats.transitions
    );
    output.push_str("# HELP launchpad_ingest_retries_total Transient failure retries\n");
    output.push_str("# TYPE launchpad_ingest_retries_total counter\n");
    let _ = writeln!(output, "launchpad_ingest_retries_total {}", stats.retries);
    let _ = writeln!(
        output,
        "launchpad_live_log_subscribers {}",
        state.broadcaster.subscriber_count()
    );

    Ok((
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        output,
    )
        .into_response())
}

/// Health response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{AdmissionConfig, IngestionConfig, SchedulerConfig};
    use crate::dispatch::{MockScheduler, TaskDispatcher};
    use crate::events::MemoryEventStore;
    use crate::ingest::IngestionPipeline;
    use crate::store::MemoryStore;
    use crate::stream::MemoryStream;

    pub(crate) const TEST_SECRET: &str = "hook-secret";

    /// Memory-backed state plus the handles tests poke at directly.
    pub(crate) struct TestApp {
        pub store: Arc<MemoryStore>,
        pub events: Arc<MemoryEventStore>,
        pub stream: Arc<MemoryStream>,
        pub scheduler: Arc<MockScheduler>,
        pub pipeline: IngestionPipeline,
        pub state: AppState,
    }

    pub(crate) fn test_app_with(scheduler: MockScheduler) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let stream = Arc::new(MemoryStream::new(2));
        let scheduler = Arc::new(scheduler);
        let broadcaster = LogBroadcaster::new(64);
        let policy = AdmissionConfig::default();

        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&scheduler) as Arc<_>,
            Arc::clone(&store) as Arc<_>,
            SchedulerConfig::default(),
        ));
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&store) as Arc<_>,
            dispatcher,
            policy,
        ));
        let pipeline = IngestionPipeline::new(
            Arc::clone(&stream) as Arc<_>,
            Arc::clone(&events) as Arc<_>,
            Arc::clone(&store) as Arc<_>,
            broadcaster.clone(),
            IngestionConfig::default(),
            "api-test",
        );
        let state = AppState {
            store: Arc::clone(&store) as Arc<_>,
            events: Arc::clone(&events) as Arc<_>,
            stream: Arc::clone(&stream) as Arc<_>,
            broadcaster,
            admission: Arc::clone(&admission),
            projects: Arc::new(ProjectService::new(Arc::clone(&store) as Arc<_>, policy)),
            webhook: Arc::new(WebhookTrigger::new(
                Some(SecretString::from(TEST_SECRET.to_owned())),
                Arc::clone(&store) as Arc<_>,
                admission,
            )),
            stats: pipeline.stats(),
            api: ApiConfig::default(),
        };

        TestApp {
            store,
            events,
            stream,
            scheduler,
            pipeline,
            state,
        }
    }

    pub(crate) fn test_app() -> TestApp {
        test_app_with(MockScheduler::default())
    }

    pub(crate) async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    pub(crate) async fn send_json(
        app: &TestApp,
        request: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let (status, body) = send(app, request).await;
        let value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    pub(crate) fn json_request(
        method: &str,
        uri: &str,
        body: &serde_json::Value,
    ) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub(crate) fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = test_app();
        let (status, body) = send_json(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn ready_endpoint() {
        let app = test_app();
        let (status, body) = send_json(&app, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let app = test_app();
        let (status, body) = send(&app, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);

        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("launchpad_deployments{status=\"QUEUED\"} 0"));
        assert!(text.contains("launchpad_ingest_messages_total{outcome=\"malformed\"} 0"));
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (
                ControlError::DeploymentNotFound("d".to_owned()),
                StatusCode::NOT_FOUND,
            ),
            (
                ControlError::DeploymentInFlight {
                    project: "p".to_owned(),
                },
                StatusCode::CONFLICT,
            ),
            (
                ControlError::Unauthorized("x".to_owned()),
                StatusCode::UNAUTHORIZED,
            ),
            (ControlError::Forbidden("x".to_owned()), StatusCode::FORBIDDEN),
            (ControlError::validation("x"), StatusCode::BAD_REQUEST),
            (
                ControlError::transient("down"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ControlError::internal("boom"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }
}
