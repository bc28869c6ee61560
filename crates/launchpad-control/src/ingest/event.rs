//! Wire format of build-worker messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ControlError, ControlResult};
use crate::stream::StreamMessage;
use crate::types::{DeploymentId, EventId, LogEvent};

/// Metadata key carrying the project id.
pub const META_PROJECT_ID: &str = "PROJECT_ID";
/// Metadata key carrying the deployment id.
pub const META_DEPLOYMENT_ID: &str = "DEPLOYMENT_ID";

/// Largest emitter-assigned sequence accepted.
pub const MAX_EMITTER_SEQUENCE: u64 = OFFSET_SEQUENCE_BASE - 1;

/// Added to the partition offset when a message carries no sequence.
///
/// Offset-derived sequences live above every emitter-assigned one, so the
/// two never share a `(deployment_id, sequence)` key.
pub const OFFSET_SEQUENCE_BASE: u64 = 1 << 62;

/// One log line as emitted by the build worker.
///
/// ```json
/// {"PROJECT_ID": "...", "DEPLOYMENT_ID": "...", "log": "Build started......",
///  "metadata": {"step": "install"}, "sequence": 3}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    /// Project the build belongs to.
    #[serde(rename = "PROJECT_ID")]
    pub project_id: String,
    /// Deployment the line belongs to; also the partition key.
    #[serde(rename = "DEPLOYMENT_ID")]
    pub deployment_id: String,
    /// The log line.
    pub log: String,
    /// Arbitrary emitter key/values.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Emitter-assigned ordering key, at most [`MAX_EMITTER_SEQUENCE`].
    ///
    /// When absent the partition offset is used, shifted by
    /// [`OFFSET_SEQUENCE_BASE`]. A worker should either always send it or
    /// never send it: lines of both kinds are all kept, but lines without a
    /// sequence sort after every line with one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl WorkerMessage {
    /// Parse a raw payload.
    ///
    /// Fails with `MalformedEvent` on invalid JSON, missing fields, an empty
    /// deployment id or a sequence above [`MAX_EMITTER_SEQUENCE`].
    pub fn parse(payload: &[u8]) -> ControlResult<Self> {
        let message: Self = serde_json::from_slice(payload)
            .map_err(|e| ControlError::MalformedEvent(e.to_string()))?;
        if message.deployment_id.trim().is_empty() {
            return Err(ControlError::MalformedEvent(
                "empty DEPLOYMENT_ID".to_owned(),
            ));
        }
        if let Some(sequence) = message.sequence.filter(|s| *s > MAX_EMITTER_SEQUENCE) {
            return Err(ControlError::MalformedEvent(format!(
                "sequence {sequence} exceeds {MAX_EMITTER_SEQUENCE}"
            )));
        }
        Ok(message)
    }

    /// Turn the message into a storable event with a fresh event id.
    ///
    /// The correlation ids are folded into the metadata; emitter keys of the
    /// same name take precedence.
    #[must_use]
    pub fn into_log_event(self, source: &StreamMessage) -> LogEvent {
        let mut metadata = Map::with_capacity(self.metadata.len() + 2);
        metadata.insert(META_PROJECT_ID.to_owned(), Value::String(self.project_id));
        metadata.insert(
            META_DEPLOYMENT_ID.to_owned(),
            Value::String(self.deployment_id.clone()),
        );
        metadata.extend(self.metadata);

        LogEvent {
            event_id: EventId::generate(),
            deployment_id: DeploymentId::new(self.deployment_id),
            sequence: self
                .sequence
                .unwrap_or_else(|| OFFSET_SEQUENCE_BASE.saturating_add(source.offset)),
            timestamp: source.appended_at,
            log: self.log,
            metadata,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use rstest::rstest;

    use super::*;

    fn source(offset: u64) -> StreamMessage {
        StreamMessage {
            partition: 0,
            offset,
            payload: Vec::new(),
            appended_at: Utc::now(),
        }
    }

    #[test]
    fn parses_minimal_message() {
        let raw = br#"{"PROJECT_ID":"p1","DEPLOYMENT_ID":"d1","log":"Build started......"}"#;
        let message = WorkerMessage::parse(raw).unwrap();
        assert_eq!(message.deployment_id, "d1");
        assert!(message.metadata.is_empty());
        assert!(message.sequence.is_none());
    }

    #[rstest]
    #[case::not_json(&b"not json"[..])]
    #[case::missing_log(&br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":"d"}"#[..])]
    #[case::empty_deployment(&br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":" ","log":"x"}"#[..])]
    #[case::wrong_type(&br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":"d","log":42}"#[..])]
    #[case::sequence_too_large(
        &br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":"d","log":"x","sequence":4611686018427387904}"#[..]
    )]
    fn rejects_malformed(#[case] raw: &[u8]) {
        let err = WorkerMessage::parse(raw).unwrap_err();
        assert!(matches!(err, ControlError::MalformedEvent(_)));
    }

    #[test]
    fn sequence_falls_back_to_offset() {
        let raw = br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":"d","log":"x"}"#;
        let event = WorkerMessage::parse(raw).unwrap().into_log_event(&source(17));
        assert_eq!(event.sequence, OFFSET_SEQUENCE_BASE + 17);

        let raw = br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":"d","log":"x","sequence":3}"#;
        let event = WorkerMessage::parse(raw).unwrap().into_log_event(&source(17));
        assert_eq!(event.sequence, 3);
    }

    #[test]
    fn offset_fallback_never_meets_an_emitter_sequence() {
        let explicit = br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":"d","log":"a","sequence":5}"#;
        let implicit = br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":"d","log":"b"}"#;

        let a = WorkerMessage::parse(explicit).unwrap().into_log_event(&source(9));
        let b = WorkerMessage::parse(implicit).unwrap().into_log_event(&source(5));
        assert_ne!(a.sequence, b.sequence);
        assert!(b.sequence > MAX_EMITTER_SEQUENCE);
    }

    #[test]
    fn correlation_ids_are_folded_into_metadata() {
        let raw = br#"{"PROJECT_ID":"p","DEPLOYMENT_ID":"d","log":"x","metadata":{"step":"install"}}"#;
        let event = WorkerMessage::parse(raw).unwrap().into_log_event(&source(0));
        assert_eq!(event.metadata[META_PROJECT_ID], "p");
        assert_eq!(event.metadata[META_DEPLOYMENT_ID], "d");
        assert_eq!(event.metadata["step"], "install");
        assert_eq!(event.deployment_id.as_str(), "d");
    }
}
