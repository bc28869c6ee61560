//! Error types for launchpad-control.

use crate::types::DeploymentId;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Project not found.
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// A deployment for this project is already queued or in progress.
    #[error("deployment already in flight for project {project}")]
    DeploymentInFlight {
        /// Project identifier.
        project: String,
    },

    /// A project with this name already exists.
    #[error("project name already taken: {0}")]
    ProjectExists(String),

    /// The generated subdomain slug collides with an existing project.
    #[error("slug already taken: {0}")]
    SlugTaken(String),

    /// Webhook signature missing or invalid.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller does not own the project.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The task scheduler rejected the launch or could not be reached.
    #[error("dispatch of deployment {deployment_id} failed: {reason}")]
    DispatchFailure {
        /// Deployment that was marked FAILED.
        deployment_id: DeploymentId,
        /// Scheduler or transport error.
        reason: String,
    },

    /// The task scheduler refused the launch or returned garbage.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// A stream message could not be parsed.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A store was temporarily unavailable.
    #[error("store temporarily unavailable: {0}")]
    TransientStore(String),

    /// Request validation failed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Event stream error.
    #[error("stream error: {0}")]
    Stream(#[from] crate::stream::StreamError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a scheduler error.
    #[must_use]
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Create a transient store error.
    #[must_use]
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientStore(msg.into())
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Connection-level database failures count as transient; constraint
    /// violations and decoding errors do not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientStore(_) => true,
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            Self::Stream(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the error is the one-in-flight-per-project guard.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::DeploymentInFlight { .. })
    }
}

/// Whether a database error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}
