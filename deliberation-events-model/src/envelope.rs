use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ids::{SessionId, Sequence};
use crate::priority::{classify, EventPriority};

/// The unit of delivery through the pipeline.
///
/// Immutable once constructed. `sequence` is strictly monotone per
/// `session_id`, assigned by the sequence counter at publish time (or at
/// merge-emission time for merged expert events).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Envelope {
    pub session_id: SessionId,
    pub sequence: Sequence,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub data: Value,
}

impl Envelope {
    pub fn new(
        session_id: SessionId,
        sequence: Sequence,
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
        request_id: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            session_id,
            sequence,
            event_type: event_type.into(),
            timestamp,
            request_id,
            data,
        }
    }

    pub fn priority(&self) -> EventPriority {
        classify(&self.event_type)
    }
}
