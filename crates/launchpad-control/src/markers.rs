//! Log-line markers that drive status transitions.
//!
//! The build worker has no structured status channel; phases are inferred
//! from substrings in its log lines. Rules are evaluated in order and the
//! first matching rule wins, so the order is part of the contract with the
//! build worker.

use serde::{Deserialize, Serialize};

use crate::types::DeploymentStatus;

/// A single `(pattern, resulting status)` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRule {
    /// Substring to look for in the log line.
    pub pattern: String,
    /// Status to transition to when the pattern matches.
    pub status: DeploymentStatus,
}

impl MarkerRule {
    /// Create a new rule.
    #[must_use]
    pub fn new(pattern: impl Into<String>, status: DeploymentStatus) -> Self {
        Self {
            pattern: pattern.into(),
            status,
        }
    }
}

/// Ordered set of marker rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerSet {
    rules: Vec<MarkerRule>,
}

impl MarkerSet {
    /// Build a marker set from rules in priority order.
    #[must_use]
    pub fn new(rules: Vec<MarkerRule>) -> Self {
        Self { rules }
    }

    /// Return the status of the first rule whose pattern occurs in `line`.
    #[must_use]
    pub fn classify(&self, line: &str) -> Option<DeploymentStatus> {
        self.rules
            .iter()
            .find(|rule| !rule.pattern.is_empty() && line.contains(&rule.pattern))
            .map(|rule| rule.status)
    }

    /// The rules, in priority order.
    #[must_use]
    pub fn rules(&self) -> &[MarkerRule] {
        &self.rules
    }
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

/// The markers emitted by the stock build worker.
///
/// The worker forwards every stderr chunk as `ERROR: <chunk>`, warnings
/// included, so that prefix is not a failure marker.
#[must_use]
pub fn default_rules() -> Vec<MarkerRule> {
    vec![
        MarkerRule::new("Build started", DeploymentStatus::InProgress),
        MarkerRule::new("All files uploaded successfully", DeploymentStatus::Ready),
        MarkerRule::new("Build failed", DeploymentStatus::Failed),
    ]
}
