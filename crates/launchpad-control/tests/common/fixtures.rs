//! Test fixtures for control plane integration tests.

use launchpad_control::DeploymentId;
use serde_json::{json, Map, Value};

/// Builder for build-worker log messages.
pub struct WorkerLine {
    project_id: String,
    deployment_id: String,
    log: String,
    sequence: Option<u64>,
    metadata: Map<String, Value>,
}

impl WorkerLine {
    /// Creates a log line for the given deployment.
    pub fn new(deployment_id: &DeploymentId, log: &str) -> Self {
        Self {
            project_id: "test-project".to_owned(),
            deployment_id: deployment_id.to_string(),
            log: log.to_owned(),
            sequence: None,
            metadata: Map::new(),
        }
    }

    /// Sets the emitter-assigned sequence.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Sets the project id carried in the message.
    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = project_id.to_owned();
        self
    }

    /// Adds an emitter metadata entry.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_owned(), Value::String(value.to_owned()));
        self
    }

    /// The partition key.
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Serialised wire payload.
    pub fn payload(&self) -> Vec<u8> {
        let mut message = json!({
            "PROJECT_ID": self.project_id,
            "DEPLOYMENT_ID": self.deployment_id,
            "log": self.log,
        });
        if let Some(sequence) = self.sequence {
            message["sequence"] = json!(sequence);
        }
        if !self.metadata.is_empty() {
            message["metadata"] = Value::Object(self.metadata.clone());
        }
        message.to_string().into_bytes()
    }
}
