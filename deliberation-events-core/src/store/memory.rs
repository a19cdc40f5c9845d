use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deliberation_events_contracts::{PermanentStore, TransientStore};
use deliberation_events_model::{Envelope, EventsError, EventsResult, FailedEventRecord, Sequence, SessionId};

/// Permanent-store fake used by unit and integration tests so the pipeline
/// can be exercised without a live Postgres instance.
#[derive(Debug, Default)]
pub struct InMemoryPermanentStore {
    events: Mutex<HashMap<SessionId, Vec<Envelope>>>,
    fail: AtomicBool,
}

impl InMemoryPermanentStore {
    /// Makes every subsequent write fail, to exercise the retry/DLQ paths.
    pub fn always_fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn stop_failing(&self) {
        self.fail.store(false, Ordering::SeqCst);
    }

    pub async fn count(&self, session_id: &SessionId) -> usize {
        self.events
            .lock()
            .unwrap()
            .get(session_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub async fn all(&self, session_id: &SessionId) -> Vec<Envelope> {
        self.events
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PermanentStore for InMemoryPermanentStore {
    async fn save_event(&self, envelope: &Envelope) -> EventsResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EventsError::Internal("simulated permanent store failure".into()));
        }
        self.events
            .lock()
            .unwrap()
            .entry(envelope.session_id.clone())
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    async fn save_events_batch(&self, envelopes: &[Envelope]) -> EventsResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EventsError::Internal("simulated permanent store failure".into()));
        }
        let mut guard = self.events.lock().unwrap();
        for envelope in envelopes {
            guard.entry(envelope.session_id.clone()).or_default().push(envelope.clone());
        }
        Ok(())
    }

    async fn get_events(&self, session_id: &SessionId, since: Sequence) -> EventsResult<Vec<Envelope>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(session_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence.value() > since.value())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn max_sequence(&self, session_id: &SessionId) -> EventsResult<Option<Sequence>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(session_id)
            .and_then(|events| events.iter().map(|e| e.sequence.value()).max())
            .map(Sequence))
    }
}

/// Transient-store fake: in-process history + retry/DLQ queues.
#[derive(Debug, Default)]
pub struct InMemoryTransientStore {
    history: Mutex<HashMap<SessionId, Vec<Envelope>>>,
    retry_queue: Mutex<Vec<FailedEventRecord>>,
    dlq: Mutex<Vec<FailedEventRecord>>,
}

#[async_trait]
impl TransientStore for InMemoryTransientStore {
    async fn append(&self, envelope: &Envelope, _ttl_seconds: u64) -> EventsResult<()> {
        self.history
            .lock()
            .unwrap()
            .entry(envelope.session_id.clone())
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    async fn history_since(&self, session_id: &SessionId, since: Sequence) -> EventsResult<Vec<Envelope>> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(session_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence.value() > since.value())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn enqueue_retry(&self, record: &FailedEventRecord) -> EventsResult<()> {
        self.retry_queue.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn claim_due_retries(&self, now: DateTime<Utc>, limit: usize) -> EventsResult<Vec<FailedEventRecord>> {
        let mut guard = self.retry_queue.lock().unwrap();
        let mut claimed = Vec::new();
        let mut remaining = Vec::with_capacity(guard.len());
        for record in guard.drain(..) {
            if claimed.len() < limit && record.next_retry_at <= now {
                claimed.push(record);
            } else {
                remaining.push(record);
            }
        }
        *guard = remaining;
        Ok(claimed)
    }

    async fn reschedule_retry(&self, record: &FailedEventRecord) -> EventsResult<()> {
        self.retry_queue.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn move_to_dlq(&self, record: &FailedEventRecord) -> EventsResult<()> {
        self.dlq.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn retry_depth(&self) -> EventsResult<u64> {
        Ok(self.retry_queue.lock().unwrap().len() as u64)
    }

    async fn dlq_depth(&self) -> EventsResult<u64> {
        Ok(self.dlq.lock().unwrap().len() as u64)
    }
}
