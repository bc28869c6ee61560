//! Git push webhook trigger.
//!
//! Deliveries are authenticated with an HMAC-SHA256 over the raw body,
//! carried as `X-Hub-Signature-256: sha256=<hex>`. Nothing in the body is
//! looked at before the signature checks out.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::error::{ControlError, ControlResult};
use crate::store::DeploymentStore;
use crate::types::DeploymentId;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
/// Header carrying the event type.
pub const EVENT_HEADER: &str = "x-github-event";

const SIGNATURE_PREFIX: &str = "sha256=";
const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Reason given for every push that names a project but deploys nothing.
///
/// Unknown projects, other branches and in-flight deployments share it so a
/// sender cannot learn which project names exist.
pub const PUSH_NOT_DEPLOYED: &str = "push did not trigger a deployment";

/// What a verified delivery resulted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// A deployment was admitted.
    Deployed {
        /// The new deployment.
        deployment_id: DeploymentId,
    },
    /// The delivery was valid but required no action.
    Ignored {
        /// Why nothing happened.
        reason: String,
    },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

/// The part of a push payload the trigger reads.
#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
}

/// Turns verified push deliveries into deployment requests.
pub struct WebhookTrigger {
    secret: Option<SecretString>,
    store: Arc<dyn DeploymentStore>,
    admission: Arc<AdmissionController>,
}

impl WebhookTrigger {
    /// Create a new trigger. Without a secret every delivery is rejected.
    pub fn new(
        secret: Option<SecretString>,
        store: Arc<dyn DeploymentStore>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            secret,
            store,
            admission,
        }
    }

    /// Handle one delivery.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for a missing or wrong signature (or no configured
    /// secret), `Validation` for a verified body that is not a push payload.
    /// Dispatch failures of the admitted deployment are passed through.
    pub async fn handle_push(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        event_type: Option<&str>,
        project_name: Option<&str>,
    ) -> ControlResult<WebhookOutcome> {
        self.verify(payload, signature)?;

        if event_type != Some("push") {
            let event = event_type.unwrap_or("-");
            warn!(event, "ignoring non-push delivery");
            return Ok(WebhookOutcome::ignored(format!("event type {event} is not handled")));
        }

        let push: PushEvent = serde_json::from_slice(payload)
            .map_err(|e| ControlError::validation(format!("invalid push payload: {e}")))?;
        let Some(branch) = push.git_ref.strip_prefix(BRANCH_REF_PREFIX) else {
            warn!(git_ref = %push.git_ref, "ignoring push of non-branch ref");
            return Ok(WebhookOutcome::ignored(format!("{} is not a branch", push.git_ref)));
        };

        let Some(name) = project_name.filter(|n| !n.is_empty()) else {
            warn!("push delivery without a project");
            return Ok(WebhookOutcome::ignored(PUSH_NOT_DEPLOYED));
        };
        let Some(project) = self.store.get_project_by_name(name).await? else {
            warn!(project = name, "push for unknown project");
            return Ok(WebhookOutcome::ignored(PUSH_NOT_DEPLOYED));
        };

        if branch != project.default_branch {
            info!(
                project = %project.id,
                branch,
                default_branch = %project.default_branch,
                "ignoring push to non-default branch"
            );
            return Ok(WebhookOutcome::ignored(PUSH_NOT_DEPLOYED));
        }

        match self.admission.request_trusted(&project).await {
            Ok(record) => {
                info!(
                    deployment_id = %record.id,
                    project = %project.id,
                    branch,
                    "push triggered deployment"
                );
                Ok(WebhookOutcome::Deployed {
                    deployment_id: record.id,
                })
            }
            Err(e) if e.is_conflict() => {
                info!(project = %project.id, "push ignored, deployment already in flight");
                Ok(WebhookOutcome::ignored(PUSH_NOT_DEPLOYED))
            }
            Err(e) => Err(e),
        }
    }

    fn verify(&self, payload: &[u8], signature: Option<&str>) -> ControlResult<()> {
        let Some(secret) = &self.secret else {
            warn!("webhook delivery rejected, no secret configured");
            return Err(ControlError::Unauthorized("webhook secret not configured".to_owned()));
        };
        let provided = signature
            .and_then(|s| s.trim().strip_prefix(SIGNATURE_PREFIX))
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or_else(|| {
                warn!("webhook delivery rejected, missing or malformed signature");
                ControlError::Unauthorized("missing or malformed signature".to_owned())
            })?;

        let expected = sign_raw(secret.expose_secret().as_bytes(), payload)?;
        if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            Ok(())
        } else {
            warn!("webhook delivery rejected, signature mismatch");
            Err(ControlError::Unauthorized("signature mismatch".to_owned()))
        }
    }
}

impl std::fmt::Debug for WebhookTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookTrigger")
            .field("secret_configured", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

fn sign_raw(key: &[u8], payload: &[u8]) -> ControlResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ControlError::internal(format!("invalid webhook key: {e}")))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compute the `sha256=<hex>` header value a sender would attach.
pub fn signature_header(secret: &str, payload: &[u8]) -> ControlResult<String> {
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(sign_raw(secret.as_bytes(), payload)?)
    ))
}
