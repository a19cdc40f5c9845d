use chrono::{DateTime, Utc};

use crate::envelope::Envelope;

/// A persistence attempt that failed and is held in the retry queue (or,
/// once exhausted, the dead letter queue).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FailedEventRecord {
    pub envelope: Envelope,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub original_error: String,
    pub moved_to_dlq_at: Option<DateTime<Utc>>,
}

impl FailedEventRecord {
    pub fn new(envelope: Envelope, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            envelope,
            retry_count: 0,
            first_failed_at: now,
            next_retry_at: now,
            original_error: error.into(),
            moved_to_dlq_at: None,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.moved_to_dlq_at.is_some()
    }
}
