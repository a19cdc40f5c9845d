use std::fmt;
use std::str::FromStr;

use crate::error::EventsError;

/// Identifier of a deliberation session. Sessions are the unit of ordering:
/// sequence numbers are only monotone within a single `SessionId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of the expert whose sub-events are reduced by the merger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExpertId(pub String);

impl ExpertId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExpertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone per-session position. Starts at 1 (post-increment from 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sequence(pub u64);

impl Sequence {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cursor used by consumers to resume delivery: `session_id:sequence`.
/// Malformed cursors are treated as "replay everything" by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor {
    pub session_id: SessionId,
    pub sequence: Sequence,
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.sequence.value())
    }
}

impl FromStr for EventCursor {
    type Err = EventsError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (session, seq) = raw
            .rsplit_once(':')
            .ok_or_else(|| EventsError::InvalidEnvelope(format!("malformed cursor: {raw}")))?;
        let seq: u64 = seq
            .parse()
            .map_err(|_| EventsError::InvalidEnvelope(format!("malformed cursor: {raw}")))?;
        Ok(Self {
            session_id: SessionId::new(session),
            sequence: Sequence(seq),
        })
    }
}
