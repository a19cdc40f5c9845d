//! Collaborator trait surfaces the pipeline core depends on but does not
//! implement: the transient store, the permanent store, the clock, and the
//! correlation id provider. Concrete backends live in the core crate;
//! in-memory fakes for tests implement these same traits.
#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deliberation_events_model::{Envelope, EventsResult, FailedEventRecord, Sequence, SessionId};

/// Ordered per-session history with bounded TTL, plus a scored set used by
/// the retry queue and dead letter queue. Implemented over Redis in the
/// core crate; an in-memory implementation backs the test suite. Live
/// fanout is a separate, purely in-process concern (see
/// `deliberation_events_core::pubsub::PubSubBus`) since this pipeline does
/// not shard a single session's subscribers across processes.
#[async_trait]
pub trait TransientStore: Send + Sync {
    /// Append an envelope to the session's ordered history, refreshing the
    /// TTL on the key.
    async fn append(&self, envelope: &Envelope, ttl_seconds: u64) -> EventsResult<()>;

    /// Range-read history for a session with `sequence > since`.
    async fn history_since(
        &self,
        session_id: &SessionId,
        since: Sequence,
    ) -> EventsResult<Vec<Envelope>>;

    /// Insert a failed-event record into the retry queue, scored by
    /// `next_retry_at`.
    async fn enqueue_retry(&self, record: &FailedEventRecord) -> EventsResult<()>;

    /// Claim and return records whose score is at or before `now`, removing
    /// them from the queue atomically so concurrent scanners do not double
    /// process the same record.
    async fn claim_due_retries(&self, now: DateTime<Utc>, limit: usize) -> EventsResult<Vec<FailedEventRecord>>;

    /// Re-insert a record after a failed retry attempt.
    async fn reschedule_retry(&self, record: &FailedEventRecord) -> EventsResult<()>;

    /// Move a record to the dead letter set.
    async fn move_to_dlq(&self, record: &FailedEventRecord) -> EventsResult<()>;

    /// Current depth of the retry queue.
    async fn retry_depth(&self) -> EventsResult<u64>;

    /// Current depth of the dead letter queue.
    async fn dlq_depth(&self) -> EventsResult<u64>;
}

/// Durable append-only per-session event log.
#[async_trait]
pub trait PermanentStore: Send + Sync {
    /// Persist a single envelope.
    async fn save_event(&self, envelope: &Envelope) -> EventsResult<()>;

    /// Persist a batch of envelopes atomically. Implementations may choose
    /// to fall back to per-row inserts internally, but callers see a single
    /// all-or-nothing outcome.
    async fn save_events_batch(&self, envelopes: &[Envelope]) -> EventsResult<()>;

    /// Read events for a session with `sequence > since`, in ascending
    /// order.
    async fn get_events(
        &self,
        session_id: &SessionId,
        since: Sequence,
    ) -> EventsResult<Vec<Envelope>>;

    /// Highest sequence already persisted for a session, used to recover
    /// the in-memory sequence counter on cold start.
    async fn max_sequence(&self, session_id: &SessionId) -> EventsResult<Option<Sequence>>;
}

/// Abstracts wall-clock access so retry scheduling and timestamps can be
/// driven deterministically in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Supplies a correlation id for envelopes that do not carry a `request_id`
/// from their producer context.
pub trait CorrelationIdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// UUIDv7 correlation id provider, matching the rest of this stack's
/// preference for time-ordered identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7CorrelationIdProvider;

impl CorrelationIdProvider for UuidV7CorrelationIdProvider {
    fn new_id(&self) -> String {
        uuid::Uuid::now_v7().to_string()
    }
}
