//! Stale-deployment reaper.
//!
//! Build workers that die without emitting a failure marker would leave
//! their deployment QUEUED or IN_PROGRESS forever, blocking the project.
//! The reaper periodically fails every in-flight deployment older than the
//! configured threshold.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReaperConfig;
use crate::error::{ControlError, ControlResult};
use crate::store::DeploymentStore;
use crate::types::DeploymentId;

/// Periodically fails deployments stuck in flight.
pub struct StaleDeploymentReaper {
    store: Arc<dyn DeploymentStore>,
    interval: Duration,
    stale_after: Duration,
}

impl StaleDeploymentReaper {
    /// Create a new reaper.
    pub fn new(store: Arc<dyn DeploymentStore>, config: &ReaperConfig) -> Self {
        Self {
            store,
            interval: config.interval(),
            stale_after: config.stale_after(),
        }
    }

    /// Error recorded on reaped deployments.
    #[must_use]
    pub fn reason(&self) -> String {
        format!("timed out after {}", format_threshold(self.stale_after))
    }

    /// Run one sweep as of `now`.
    ///
    /// Returns the deployments that were failed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ControlResult<Vec<DeploymentId>> {
        let age = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| ControlError::Config(format!("reaper threshold: {e}")))?;
        let cutoff = now - age;

        let reaped = self.store.fail_stale(cutoff, &self.reason()).await?;
        if reaped.is_empty() {
            debug!(cutoff = %cutoff, "no stale deployments");
        } else {
            for id in &reaped {
                info!(deployment_id = %id, "stale deployment failed");
            }
            info!(count = reaped.len(), cutoff = %cutoff, "reaper sweep complete");
        }
        Ok(reaped)
    }

    /// Run one sweep now.
    pub async fn sweep(&self) -> ControlResult<Vec<DeploymentId>> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep every interval until `cancel` fires.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval = ?self.interval,
            stale_after = ?self.stale_after,
            "reaper started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "reaper sweep failed");
                    }
                }
            }
        }
        info!("reaper stopped");
    }
}

impl std::fmt::Debug for StaleDeploymentReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleDeploymentReaper")
            .field("interval", &self.interval)
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

fn format_threshold(threshold: Duration) -> String {
    let secs = threshold.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
