//! Deployment status state machine.
//!
//! Two views of the same lifecycle live here:
//!
//! - [`allowed_sources`] is the runtime rule table used for every automatic
//!   status write (dispatcher, ingestion pipeline, reaper). Stores apply a
//!   target status only when the current status is one of its sources, so a
//!   terminal deployment is never resurrected by a late or replayed marker.
//! - [`Deployment`] encodes the control-plane path (admission then dispatch)
//!   in the type system, so the dispatcher can only start or fail a deployment
//!   it holds as queued.
//!
//! ```text
//! (new) ──▶ QUEUED ──▶ IN_PROGRESS ──▶ READY
//!              │            │
//!              └────────────┴──────▶ FAILED
//! ```

use std::marker::PhantomData;

use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus};

/// Statuses from which an automatic transition into `target` is permitted.
///
/// `QUEUED` and `NOT_STARTED` have no sources: those writes only happen via
/// admission or the manual override.
#[must_use]
pub const fn allowed_sources(target: DeploymentStatus) -> &'static [DeploymentStatus] {
    match target {
        DeploymentStatus::InProgress => &[DeploymentStatus::Queued],
        DeploymentStatus::Ready => &[DeploymentStatus::InProgress],
        DeploymentStatus::Failed => &[DeploymentStatus::Queued, DeploymentStatus::InProgress],
        DeploymentStatus::NotStarted | DeploymentStatus::Queued => &[],
    }
}

/// Whether an automatic transition `from -> to` is permitted.
#[must_use]
pub fn can_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    allowed_sources(to).contains(&from)
}

// =============================================================================
// Typestate for the admission/dispatch path
// =============================================================================

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted status.
    fn status() -> DeploymentStatus;
}

mod private {
    pub trait Sealed {}
}

/// Admitted, not yet dispatched.
#[derive(Debug, Clone, Copy)]
pub struct Queued;

/// Accepted by the task scheduler.
#[derive(Debug, Clone, Copy)]
pub struct InProgress;

/// Dispatch failed.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

impl private::Sealed for Queued {}
impl private::Sealed for InProgress {}
impl private::Sealed for Failed {}

impl DeploymentState for Queued {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Queued
    }
}

impl DeploymentState for InProgress {
    fn status() -> DeploymentStatus {
        DeploymentStatus::InProgress
    }
}

impl DeploymentState for Failed {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Failed
    }
}

/// A deployment in a specific control-plane state.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    record: DeploymentRecord,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get the underlying record.
    #[must_use]
    pub const fn record(&self) -> &DeploymentRecord {
        &self.record
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.record.id
    }

    /// Get the status this state persists as.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::status()
    }

    /// Consume the deployment, returning the record.
    #[must_use]
    pub fn into_record(self) -> DeploymentRecord {
        self.record
    }

    fn transition_with<T: DeploymentState>(
        mut self,
        f: impl FnOnce(&mut DeploymentRecord),
    ) -> Deployment<T> {
        f(&mut self.record);
        self.record.status = T::status();
        self.record.updated_at = chrono::Utc::now();
        Deployment {
            record: self.record,
            _state: PhantomData,
        }
    }
}

impl Deployment<Queued> {
    /// Wrap a freshly admitted record.
    #[must_use]
    pub fn admit(mut record: DeploymentRecord) -> Self {
        record.status = DeploymentStatus::Queued;
        Self {
            record,
            _state: PhantomData,
        }
    }

    /// The scheduler accepted the build task.
    #[must_use]
    pub fn start(self) -> Deployment<InProgress> {
        self.transition_with(|_| {})
    }

    /// The scheduler rejected the task or could not be reached.
    #[must_use]
    pub fn fail(self, error: String) -> Deployment<Failed> {
        self.transition_with(|record| record.error = Some(error))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::types::ProjectId;

    use crate::types::DeploymentStatus::{
        Failed as F, InProgress as P, NotStarted as N, Queued as Q, Ready as R,
    };

    #[rstest]
    #[case(Q, P, true)]
    #[case(P, R, true)]
    #[case(P, F, true)]
    #[case(Q, F, true)]
    #[case(P, P, false)]
    #[case(Q, R, false)]
    #[case(R, F, false)]
    #[case(F, R, false)]
    #[case(F, P, false)]
    #[case(R, P, false)]
    #[case(N, Q, false)]
    #[case(R, Q, false)]
    fn automatic_transitions(
        #[case] from: DeploymentStatus,
        #[case] to: DeploymentStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(can_transition(from, to), allowed);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for target in DeploymentStatus::ALL {
            for terminal in [R, F] {
                assert!(!can_transition(terminal, target));
            }
        }
    }

    #[test]
    fn dispatch_accept_path() {
        let queued = Deployment::admit(DeploymentRecord::queued(ProjectId::new("p")));
        assert_eq!(queued.status(), Q);

        let started = queued.start();
        assert_eq!(started.status(), P);
        assert_eq!(started.record().status, P);
        assert!(started.record().error.is_none());
    }

    #[test]
    fn dispatch_reject_path_records_error() {
        let queued = Deployment::admit(DeploymentRecord::queued(ProjectId::new("p")));
        let id = queued.id().clone();

        let failed = queued.fail("scheduler rejected task".to_owned());
        assert_eq!(failed.status(), F);

        let record = failed.into_record();
        assert_eq!(record.id, id);
        assert_eq!(record.status, F);
        assert_eq!(record.error.as_deref(), Some("scheduler rejected task"));
    }
}
