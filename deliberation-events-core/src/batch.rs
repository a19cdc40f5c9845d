use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use deliberation_events_contracts::PermanentStore;
use deliberation_events_model::{Envelope, EventPriority, PipelineConfig, SessionId};
use tokio::sync::Mutex;

use crate::metrics::PipelineMetrics;
use crate::pipeline::EventPipeline;
use crate::retry::RetryQueue;

/// Coalesces normal/low priority envelopes into periodic writes to the
/// permanent store.
///
/// The window itself is driven by an external periodic caller invoking
/// [`BatchPersister::tick`] (see [`crate::pipeline::EventPipeline`]'s
/// flush-loop task); `queue` only enforces the size-based triggers
/// (`batch_max`, `buffer_cap`).
pub struct BatchPersister {
    buffer: Mutex<Vec<Envelope>>,
    config: PipelineConfig,
    store: Arc<dyn PermanentStore>,
    retry_queue: Arc<RetryQueue>,
    metrics: Arc<PipelineMetrics>,
    /// Back-reference to the owning pipeline, used only to publish the
    /// `persistence_error` notification once a batched event exhausts its
    /// bounded immediate retries. Set once, after the pipeline's `Arc` is
    /// constructed, via [`BatchPersister::bind_pipeline`] — a plain `Arc`
    /// field would be a reference cycle, since the pipeline owns this
    /// persister too.
    pipeline: OnceLock<Weak<EventPipeline>>,
}

impl std::fmt::Debug for BatchPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPersister")
            .field("buffer", &self.buffer)
            .field("config", &self.config)
            .field("store", &"<dyn PermanentStore>")
            .field("retry_queue", &self.retry_queue)
            .field("metrics", &self.metrics)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl BatchPersister {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn PermanentStore>,
        retry_queue: Arc<RetryQueue>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            config,
            store,
            retry_queue,
            metrics,
            pipeline: OnceLock::new(),
        }
    }

    /// Supplies the back-reference used to notify the pipeline when a
    /// batched event exhausts its immediate retries. Must be called once,
    /// right after the owning `Arc<EventPipeline>` is constructed.
    pub fn bind_pipeline(&self, pipeline: &Arc<EventPipeline>) {
        let _ = self.pipeline.set(Arc::downgrade(pipeline));
    }

    /// Enqueues `envelope`, applying drop-oldest-low-priority backpressure
    /// at `buffer_cap` and flushing immediately once `batch_max` is
    /// reached.
    pub async fn queue(&self, envelope: Envelope) {
        let mut buf = self.buffer.lock().await;

        if buf.len() >= self.config.buffer_cap {
            if let Some(pos) = buf.iter().position(|e| e.priority() == EventPriority::Low) {
                buf.remove(pos);
                self.metrics.record_dropped_on_pressure();
            } else {
                let overflow = std::mem::take(&mut *buf);
                drop(buf);
                self.flush_batch(overflow).await;
                buf = self.buffer.lock().await;
            }
        }

        buf.push(envelope);

        if buf.len() >= self.config.batch_max {
            let ready = std::mem::take(&mut *buf);
            drop(buf);
            self.flush_batch(ready).await;
        }
    }

    /// Flushes whatever is currently buffered, across all sessions. No-op
    /// when the buffer is empty. Called on the batch-window timer tick.
    pub async fn tick(&self) {
        let mut buf = self.buffer.lock().await;
        if buf.is_empty() {
            return;
        }
        let ready = std::mem::take(&mut *buf);
        drop(buf);
        self.flush_batch(ready).await;
    }

    /// Extracts and persists every buffered envelope belonging to
    /// `session_id`, leaving the rest of the buffer untouched. Completes
    /// only once the write (or its retry-queue hand-off) has happened.
    pub async fn flush_session(&self, session_id: &SessionId) {
        let mine = {
            let mut buf = self.buffer.lock().await;
            let mut mine = Vec::new();
            let mut rest = Vec::with_capacity(buf.len());
            for envelope in buf.drain(..) {
                if &envelope.session_id == session_id {
                    mine.push(envelope);
                } else {
                    rest.push(envelope);
                }
            }
            *buf = rest;
            mine
        };
        self.flush_batch(mine).await;
    }

    pub async fn pending_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    async fn flush_batch(&self, batch: Vec<Envelope>) {
        if batch.is_empty() {
            return;
        }
        let size = batch.len() as u64;
        let started = Instant::now();

        match self.store.save_events_batch(&batch).await {
            Ok(()) => {
                self.metrics.record_batch_flush(size, started.elapsed());
                self.metrics.record_persisted(size);
                self.metrics.record_permanent_success();
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    batch_size = size,
                    "batch persist failed, falling back to per-event writes"
                );
                self.metrics.record_batch_flush(size, started.elapsed());
                for envelope in batch {
                    self.persist_with_bounded_retry(envelope).await;
                }
            }
        }
    }

    /// Attempts `envelope` up to `immediate_retry_attempts` times. On
    /// success, records the write and returns. On exhaustion, hands the
    /// envelope to the retry queue and publishes the same
    /// `persistence_error` notification the critical path emits, so
    /// consumers see one uniform signal regardless of which path the event
    /// took.
    async fn persist_with_bounded_retry(&self, envelope: Envelope) {
        let mut last_error = None;
        for attempt in 0..self.config.immediate_retry_attempts {
            match self.store.save_event(&envelope).await {
                Ok(()) => {
                    self.metrics.record_persisted(1);
                    self.metrics.record_permanent_success();
                    return;
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "immediate batched-path retry failed");
                    last_error = Some(err.to_string());
                }
            }
        }

        self.metrics.record_permanent_failure();
        if let Some(pipeline) = self.pipeline.get().and_then(Weak::upgrade) {
            pipeline.notify_persistence_exhausted(&envelope).await;
        }
        self.retry_queue
            .enqueue(envelope, last_error.unwrap_or_default())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryPermanentStore;
    use deliberation_events_contracts::SystemClock;
    use deliberation_events_model::{Sequence, SessionId};
    use serde_json::json;

    fn envelope(session: &str, seq: u64, event_type: &str) -> Envelope {
        Envelope::new(
            SessionId::new(session),
            Sequence(seq),
            event_type,
            chrono::Utc::now(),
            None,
            json!({}),
        )
    }

    fn persister_with_store() -> (Arc<InMemoryPermanentStore>, BatchPersister) {
        let store = Arc::new(InMemoryPermanentStore::default());
        let transient = Arc::new(crate::store::memory::InMemoryTransientStore::default());
        let metrics = Arc::new(PipelineMetrics::new());
        let config = PipelineConfig::default();
        let retry = Arc::new(RetryQueue::new(
            config.clone(),
            transient,
            store.clone(),
            metrics.clone(),
            Arc::new(SystemClock),
        ));
        let persister = BatchPersister::new(config, store.clone(), retry, metrics);
        (store, persister)
    }

    #[tokio::test]
    async fn flush_trigger_on_batch_max() {
        let mut config = PipelineConfig::default();
        config.batch_max = 3;
        let store = Arc::new(InMemoryPermanentStore::default());
        let transient = Arc::new(crate::store::memory::InMemoryTransientStore::default());
        let metrics = Arc::new(PipelineMetrics::new());
        let retry = Arc::new(RetryQueue::new(
            config.clone(),
            transient,
            store.clone(),
            metrics.clone(),
            Arc::new(SystemClock),
        ));
        let persister = BatchPersister::new(config, store.clone(), retry, metrics);

        persister.queue(envelope("s1", 1, "contribution")).await;
        persister.queue(envelope("s1", 2, "contribution")).await;
        assert_eq!(persister.pending_len().await, 2);
        persister.queue(envelope("s1", 3, "contribution")).await;
        // batch_max reached: buffer flushed synchronously inside queue().
        assert_eq!(persister.pending_len().await, 0);
        assert_eq!(store.count(&SessionId::new("s1")).await, 3);
    }

    #[tokio::test]
    async fn tick_flushes_partial_window() {
        let (store, persister) = persister_with_store();
        persister.queue(envelope("s1", 1, "contribution")).await;
        assert_eq!(store.count(&SessionId::new("s1")).await, 0);
        persister.tick().await;
        assert_eq!(store.count(&SessionId::new("s1")).await, 1);
    }

    #[tokio::test]
    async fn flush_session_only_drains_matching_session() {
        let (store, persister) = persister_with_store();
        persister.queue(envelope("s1", 1, "contribution")).await;
        persister.queue(envelope("s2", 1, "contribution")).await;
        persister.flush_session(&SessionId::new("s1")).await;

        assert_eq!(store.count(&SessionId::new("s1")).await, 1);
        assert_eq!(store.count(&SessionId::new("s2")).await, 0);
        assert_eq!(persister.pending_len().await, 1);
    }
}
