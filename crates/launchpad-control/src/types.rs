//! Core types for launchpad-control.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique identifier using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a deployment.
    ///
    /// Generated once by admission; it is the join key between the deployment
    /// store and the event store and is never reused.
    DeploymentId
);

ulid_id!(
    /// Unique identifier for a project.
    ProjectId
);

ulid_id!(
    /// Unique identifier for a user.
    UserId
);

ulid_id!(
    /// Unique identifier for a stored log event.
    EventId
);

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Implicit default before admission.
    #[default]
    NotStarted,
    /// Admitted, waiting for the build task to start.
    Queued,
    /// Build task launched or reported started.
    InProgress,
    /// Artifacts published.
    Ready,
    /// Build, dispatch or liveness failure.
    Failed,
}

impl DeploymentStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::NotStarted,
        Self::Queued,
        Self::InProgress,
        Self::Ready,
        Self::Failed,
    ];

    /// Statuses that count as a running deployment for admission purposes.
    pub const IN_FLIGHT: [Self; 2] = [Self::Queued, Self::InProgress];

    /// Get the status name as stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }

    /// READY and FAILED admit no further automatic transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// QUEUED and IN_PROGRESS.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "QUEUED" => Ok(Self::Queued),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "READY" => Ok(Self::Ready),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// A user, created lazily on the first authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user identifier.
    pub id: UserId,
    /// Unique email address.
    pub email: String,
}

/// A project: one git repository that can be deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique project identifier.
    pub id: ProjectId,
    /// Unique, human-chosen name.
    pub name: String,
    /// Git repository URL handed to the build worker.
    pub repo_url: String,
    /// Generated subdomain slug the artifacts are published under.
    pub slug: String,
    /// Branch whose pushes trigger a deployment.
    pub default_branch: String,
    /// Owning user, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    /// When the project was created.
    pub created_at: DateTime<Utc>,
}

/// A deployment record as stored in the deployment store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Project this deployment belongs to.
    pub project_id: ProjectId,
    /// Current status.
    pub status: DeploymentStatus,
    /// Error message, set on dispatch failure or reaping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the deployment was admitted.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Create a new record in the QUEUED status with a fresh id.
    #[must_use]
    pub fn queued(project_id: ProjectId) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            project_id,
            status: DeploymentStatus::Queued,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single persisted log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Generator-assigned unique id.
    pub event_id: EventId,
    /// Deployment this line belongs to.
    pub deployment_id: DeploymentId,
    /// Ordering key within the deployment.
    pub sequence: u64,
    /// When the line was appended to the stream.
    pub timestamp: DateTime<Utc>,
    /// Free-text log line.
    pub log: String,
    /// Emitter metadata plus the correlation ids.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of a compare-and-set status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The status changed.
    Applied {
        /// Status before the write.
        from: DeploymentStatus,
        /// Status after the write.
        to: DeploymentStatus,
    },
    /// The current status is not a valid source for the target; nothing changed.
    Unchanged {
        /// The status the deployment holds.
        current: DeploymentStatus,
    },
}

impl TransitionOutcome {
    /// Whether the write changed the status.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for status in DeploymentStatus::ALL {
            let parsed: DeploymentStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!(
            "in_progress".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::InProgress
        );
        assert!("RUNNING".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn status_serialises_as_screaming_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn default_status_is_not_started() {
        assert_eq!(DeploymentStatus::default(), DeploymentStatus::NotStarted);
    }

    #[test]
    fn terminal_and_in_flight_are_disjoint() {
        for status in DeploymentStatus::ALL {
            assert!(!(status.is_terminal() && status.is_in_flight()));
        }
        assert!(DeploymentStatus::Ready.is_terminal());
        assert!(DeploymentStatus::Queued.is_in_flight());
        assert!(!DeploymentStatus::NotStarted.is_in_flight());
    }

    #[test]
    fn queued_record_has_fresh_id() {
        let a = DeploymentRecord::queued(ProjectId::new("p"));
        let b = DeploymentRecord::queued(ProjectId::new("p"));
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, DeploymentStatus::Queued);
        assert_eq!(a.created_at, a.updated_at);
    }
}
