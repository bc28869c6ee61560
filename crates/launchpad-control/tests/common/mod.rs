//! Common test utilities for control plane integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;

use launchpad_control::api::AppState;
use launchpad_control::config::{
    AdmissionConfig, ApiConfig, IngestionConfig, ReaperConfig, SchedulerConfig,
};
use launchpad_control::dispatch::MockScheduler;
use launchpad_control::projects::CreateProject;
use launchpad_control::stream::StreamMessage;
use launchpad_control::{
    AdmissionController, DeploymentId, DeploymentStatus, DeploymentStore, EventStream,
    IngestionPipeline, LogBroadcaster, MemoryEventStore, MemoryStore, MemoryStream, Project,
    ProjectService, StaleDeploymentReaper, TaskDispatcher, WebhookTrigger,
};
use secrecy::SecretString;

use fixtures::WorkerLine;

/// Webhook secret configured on every test control plane.
pub const WEBHOOK_SECRET: &str = "integration-secret";

/// Complete in-memory control plane with all components wired together.
pub struct TestControlPlane {
    pub store: Arc<MemoryStore>,
    pub events: Arc<MemoryEventStore>,
    pub stream: Arc<MemoryStream>,
    pub scheduler: Arc<MockScheduler>,
    pub admission: Arc<AdmissionController>,
    pub projects: Arc<ProjectService>,
    pub pipeline: Arc<IngestionPipeline>,
    pub reaper: StaleDeploymentReaper,
    pub webhook: Arc<WebhookTrigger>,
    pub broadcaster: LogBroadcaster,
}

impl TestControlPlane {
    /// Creates a control plane whose scheduler accepts every launch.
    pub fn new() -> Self {
        Self::with_scheduler(MockScheduler::default())
    }

    /// Creates a control plane around the given scheduler.
    pub fn with_scheduler(scheduler: MockScheduler) -> Self {
        Self::with_config(scheduler, AdmissionConfig::default(), 4)
    }

    /// Creates a control plane with a custom admission policy and partition count.
    pub fn with_config(scheduler: MockScheduler, policy: AdmissionConfig, partitions: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let stream = Arc::new(MemoryStream::new(partitions));
        let scheduler = Arc::new(scheduler);
        let broadcaster = LogBroadcaster::new(256);

        let dispatcher = Arc::new(TaskDispatcher::new(
            scheduler.clone(),
            store.clone(),
            SchedulerConfig::default(),
        ));
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            dispatcher,
            policy,
        ));
        let projects = Arc::new(ProjectService::new(store.clone(), policy));
        let pipeline = Arc::new(IngestionPipeline::new(
            stream.clone(),
            events.clone(),
            store.clone(),
            broadcaster.clone(),
            IngestionConfig {
                retry_initial_ms: 1,
                retry_max_ms: 10,
                ..IngestionConfig::default()
            },
            "integration",
        ));
        let reaper = StaleDeploymentReaper::new(store.clone(), &ReaperConfig::default());
        let webhook = Arc::new(WebhookTrigger::new(
            Some(SecretString::from(WEBHOOK_SECRET.to_owned())),
            store.clone(),
            admission.clone(),
        ));

        Self {
            store,
            events,
            stream,
            scheduler,
            admission,
            projects,
            pipeline,
            reaper,
            webhook,
            broadcaster,
        }
    }

    /// State for the HTTP router.
    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            events: self.events.clone(),
            stream: self.stream.clone(),
            broadcaster: self.broadcaster.clone(),
            admission: self.admission.clone(),
            projects: self.projects.clone(),
            webhook: self.webhook.clone(),
            stats: self.pipeline.stats(),
            api: ApiConfig::default(),
        }
    }

    /// Registers a project deploying from `main`.
    pub async fn create_project(&self, name: &str) -> Project {
        self.projects
            .create(
                CreateProject {
                    name: name.to_owned(),
                    repo_url: format!("https://git.example.com/{name}.git"),
                    default_branch: None,
                },
                None,
            )
            .await
            .unwrap()
    }

    /// Publishes a worker log line to the stream.
    pub async fn emit(&self, line: WorkerLine) -> StreamMessage {
        self.stream
            .publish(line.deployment_id(), &line.payload())
            .await
            .unwrap()
    }

    /// Consumes everything published so far.
    pub async fn drain(&self) -> usize {
        self.pipeline.drain().await.unwrap()
    }

    /// Current status of a deployment.
    pub async fn status(&self, id: &DeploymentId) -> DeploymentStatus {
        self.store.get_deployment(id).await.unwrap().unwrap().status
    }
}

impl Default for TestControlPlane {
    fn default() -> Self {
        Self::new()
    }
}
