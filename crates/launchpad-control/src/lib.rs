//! Launchpad control plane
//!
//! The deployment orchestration core: it decides whether a project may start
//! a build, launches the build task, follows the worker's log stream to track
//! progress and fails deployments whose worker went silent.
//!
//! # Architecture
//!
//! - **Admission** ([`AdmissionController`]): at most one QUEUED or
//!   IN_PROGRESS deployment per project, enforced by the deployment store
//! - **Dispatch** ([`TaskDispatcher`]): launches the build task with a bounded
//!   timeout and records the outcome
//! - **Ingestion** ([`IngestionPipeline`]): consumes worker log lines, stores
//!   them idempotently and applies marker-driven status transitions
//! - **Reaping** ([`StaleDeploymentReaper`]): fails deployments stuck in
//!   flight past a threshold
//! - **Webhooks** ([`WebhookTrigger`]): turns signed git pushes into
//!   deployment requests
//! - **API** ([`api::router`]): HTTP surface for the UI and build workers
//!
//! # Status machine
//!
//! ```text
//! NOT_STARTED ──▶ QUEUED ──▶ IN_PROGRESS ──▶ READY
//!                   │             │
//!                   └─────────────┴──────▶ FAILED
//! ```
//!
//! READY and FAILED are terminal for every automatic writer. Only the manual
//! override can move a deployment out of them.

#![forbid(unsafe_code)]

pub mod admission;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod ingest;
pub mod markers;
pub mod projects;
pub mod reaper;
pub mod slug;
pub mod state;
pub mod store;
pub mod stream;
pub mod types;
pub mod webhook;

// Re-export commonly used types at the crate root
pub use admission::AdmissionController;
pub use config::ControlConfig;
pub use dispatch::{HttpTaskScheduler, TaskDispatcher, TaskScheduler};
pub use error::{ControlError, ControlResult};
pub use events::{EventStore, LogBroadcaster, MemoryEventStore, PostgresEventStore};
pub use ingest::{IngestionPipeline, PipelineStats};
pub use markers::{MarkerRule, MarkerSet};
pub use projects::ProjectService;
pub use reaper::StaleDeploymentReaper;
pub use state::{Deployment, DeploymentState, Failed, InProgress, Queued};
pub use store::{DeploymentFilter, DeploymentStore, MemoryStore, PostgresStore};
pub use stream::{EventStream, MemoryStream, PostgresStream};
pub use types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, LogEvent, Project, ProjectId,
    TransitionOutcome, User, UserId,
};
pub use webhook::{WebhookOutcome, WebhookTrigger};
