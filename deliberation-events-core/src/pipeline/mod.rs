use std::sync::Arc;
use std::time::Duration;

use deliberation_events_contracts::{Clock, CorrelationIdProvider, PermanentStore, TransientStore};
use deliberation_events_model::{Envelope, EventPriority, PipelineConfig, Sequence, SessionId};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_stream::Stream;

use crate::batch::BatchPersister;
use crate::merger::{ExpertMerger, SubEventDraft};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pubsub::PubSubBus;
use crate::retry::RetryQueue;
use crate::sequence::SequenceCounter;
use crate::subscription;

/// Event type carrying the data for an expert-attributed sub-event that the
/// merger may buffer. Identified by an `expert_id` field in the payload.
const EXPERT_EVENT_TYPES: [&str; 3] = ["expert_started", "expert_reasoning", "expert_conclusion"];

/// The facade described by the producer- and consumer-facing contract:
/// `publish`, `flush_session`, `subscribe`, `missed`, plus the operator
/// depth queries. Owns every background task the pipeline needs and tears
/// them down (after one final flush) when dropped via [`EventPipeline::shutdown`].
pub struct EventPipeline {
    config: PipelineConfig,
    sequence: SequenceCounter,
    transient: Arc<dyn TransientStore>,
    permanent: Arc<dyn PermanentStore>,
    pubsub: Arc<PubSubBus>,
    batch: Arc<BatchPersister>,
    retry_queue: Arc<RetryQueue>,
    merger: ExpertMerger,
    metrics: Arc<PipelineMetrics>,
    correlation: Arc<dyn CorrelationIdProvider>,
    clock: Arc<dyn Clock>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: tokio_util::sync::CancellationToken,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventPipeline {
    /// Builds the pipeline and eagerly spawns its background tasks: the
    /// batch-window flush loop and the retry-queue scanner.
    pub fn new(
        config: PipelineConfig,
        transient: Arc<dyn TransientStore>,
        permanent: Arc<dyn PermanentStore>,
        correlation: Arc<dyn CorrelationIdProvider>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let metrics = Arc::new(PipelineMetrics::new());
        let retry_queue = Arc::new(RetryQueue::new(
            config.clone(),
            transient.clone(),
            permanent.clone(),
            metrics.clone(),
            clock.clone(),
        ));
        let batch = Arc::new(BatchPersister::new(
            config.clone(),
            permanent.clone(),
            retry_queue.clone(),
            metrics.clone(),
        ));

        let pipeline = Arc::new(Self {
            config,
            sequence: SequenceCounter::new(),
            transient,
            permanent,
            pubsub: Arc::new(PubSubBus::default()),
            batch,
            retry_queue,
            merger: ExpertMerger::new(),
            metrics,
            correlation,
            clock,
            tasks: std::sync::Mutex::new(Vec::new()),
            shutdown: tokio_util::sync::CancellationToken::new(),
        });

        pipeline.batch.bind_pipeline(&pipeline);
        pipeline.spawn_background_tasks();
        pipeline
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let flush_handle = {
            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.flush_loop().await })
        };
        let retry_handle = {
            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.retry_scan_loop().await })
        };
        self.tasks.lock().unwrap().extend([flush_handle, retry_handle]);
    }

    async fn flush_loop(self: Arc<Self>) {
        let window = self.config.batch_window();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(window) => self.batch.tick().await,
                _ = self.shutdown.cancelled() => {
                    self.batch.tick().await;
                    break;
                }
            }
        }
    }

    async fn retry_scan_loop(self: Arc<Self>) {
        // Scanning on the same cadence as the batch window keeps retry
        // latency proportional to the configured responsiveness without a
        // second tunable.
        let interval = self.config.batch_window().max(Duration::from_millis(50));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => { self.retry_queue.scan_tick().await; },
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// Producer-facing: never fails, never blocks on persistence beyond the
    /// bounded immediate-retry window for critical events.
    pub async fn publish(&self, session_id: &SessionId, event_type: &str, data: Value, request_id: Option<String>) {
        let started = std::time::Instant::now();
        self.metrics.record_published(event_type);
        let timestamp = self.clock.now();
        let request_id = request_id.or_else(|| Some(self.correlation.new_id()));

        if let Some(expert_id) = extract_expert_id(event_type, &data) {
            let draft = SubEventDraft {
                event_type: event_type.to_string(),
                data,
                timestamp,
                request_id,
            };
            for ready in self.merger.queue(session_id, &expert_id, draft) {
                if ready.event_type == "expert_contribution_complete" {
                    self.metrics.record_expert_merge();
                }
                self.emit(session_id, ready).await;
            }
            self.metrics.record_publish_latency(started.elapsed());
            return;
        }

        let draft = SubEventDraft {
            event_type: event_type.to_string(),
            data,
            timestamp,
            request_id,
        };
        self.emit(session_id, draft).await;
        self.metrics.record_publish_latency(started.elapsed());
    }

    async fn emit(&self, session_id: &SessionId, draft: SubEventDraft) {
        let sequence = self.sequence.next(session_id);
        let envelope = Envelope::new(
            session_id.clone(),
            sequence,
            draft.event_type,
            draft.timestamp,
            draft.request_id,
            draft.data,
        );

        match self
            .transient
            .append(&envelope, self.config.transient_ttl_seconds)
            .await
        {
            Ok(()) => self.metrics.record_transient_store_success(),
            Err(err) => {
                tracing::warn!(error = %err, session_id = %session_id, "transient log append failed");
                self.metrics.record_transient_store_error();
            }
        }

        self.pubsub.publish(envelope.clone());

        match envelope.priority() {
            EventPriority::Critical => self.persist_critical(envelope).await,
            _ => self.batch.queue(envelope).await,
        }
    }

    async fn persist_critical(&self, envelope: Envelope) {
        // Flush anything already buffered for this session first so a
        // critical event never overtakes earlier normal/low events in the
        // permanent store.
        self.batch.flush_session(&envelope.session_id).await;

        let mut last_error = None;
        for attempt in 0..self.config.immediate_retry_attempts {
            match self.permanent.save_event(&envelope).await {
                Ok(()) => {
                    self.metrics.record_persisted(1);
                    self.metrics.record_permanent_success();
                    return;
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "immediate critical-path retry failed");
                    last_error = Some(err.to_string());
                }
            }
        }

        self.metrics.record_permanent_failure();
        let session_id = envelope.session_id.clone();
        let is_original_failure_report = envelope.event_type != "persistence_error";
        self.retry_queue
            .enqueue(envelope, last_error.unwrap_or_default())
            .await;

        if is_original_failure_report {
            self.emit_persistence_error(&session_id).await;
        }
    }

    /// Publishes the `persistence_error` notification event for `session_id`.
    /// Shared by the critical path ([`Self::persist_critical`]) and the
    /// batched path ([`Self::notify_persistence_exhausted`], called back
    /// from [`crate::batch::BatchPersister`]) so both signal the same way
    /// once an event exhausts its bounded immediate retries.
    async fn emit_persistence_error(&self, session_id: &SessionId) {
        let draft = SubEventDraft {
            event_type: "persistence_error".to_string(),
            data: json!({ "reason": "persist_exhausted_immediate_retries" }),
            timestamp: self.clock.now(),
            request_id: None,
        };
        Box::pin(self.emit(session_id, draft)).await;
    }

    /// Called back from [`crate::batch::BatchPersister`] once a batched
    /// (normal/low priority) event exhausts its bounded immediate retries
    /// and is handed to the background retry queue.
    pub(crate) async fn notify_persistence_exhausted(&self, envelope: &Envelope) {
        if envelope.event_type != "persistence_error" {
            self.emit_persistence_error(&envelope.session_id).await;
        }
    }

    /// Blocks until every event published for `session_id` before this call
    /// has reached the permanent store (or the retry queue, for events that
    /// failed persistence).
    pub async fn flush_session(&self, session_id: &SessionId) {
        for draft in self.merger.flush_session(session_id) {
            self.emit(session_id, draft).await;
        }
        self.batch.flush_session(session_id).await;
    }

    /// Consumer-facing: replay-then-live subscription.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        since_sequence: Option<Sequence>,
    ) -> impl Stream<Item = Envelope> {
        subscription::subscribe(
            self.transient.clone(),
            self.permanent.clone(),
            self.pubsub.clone(),
            self.metrics.clone(),
            session_id,
            since_sequence.unwrap_or(Sequence(0)),
        )
    }

    /// Consumer-facing: stateless missed-event recovery.
    pub async fn missed(&self, session_id: SessionId, last_event_id: Option<&str>) -> Vec<Envelope> {
        subscription::missed(
            self.transient.clone(),
            self.permanent.clone(),
            self.metrics.clone(),
            session_id,
            last_event_id,
        )
        .await
    }

    pub async fn retry_depth(&self) -> u64 {
        self.retry_queue.retry_depth().await
    }

    pub async fn dlq_depth(&self) -> u64 {
        self.retry_queue.dlq_depth().await
    }

    /// Assembles a full metrics snapshot: the atomics-backed counters plus
    /// the pending-events, retry-queue-depth, and DLQ-depth gauges, which
    /// live in the batch buffer and the transient store rather than in
    /// [`PipelineMetrics`] itself.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.pending_events = self.batch.pending_len().await as u64;
        snapshot.retry_queue_depth = self.retry_queue.retry_depth().await;
        snapshot.dlq_depth = self.retry_queue.dlq_depth().await;
        snapshot
    }

    /// Seeds the sequence counter for `session_id` from the permanent
    /// store's high water mark, for cold-start recovery.
    pub async fn prime_sequence(&self, session_id: &SessionId) {
        if let Ok(Some(highest)) = self.permanent.max_sequence(session_id).await {
            self.sequence.prime(session_id, highest.value());
        }
    }

    /// Cancels the background tasks after letting them run one final
    /// flush, then awaits their completion.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn extract_expert_id(event_type: &str, data: &Value) -> Option<deliberation_events_model::ExpertId> {
    if !EXPERT_EVENT_TYPES.contains(&event_type) {
        return None;
    }
    data.get("expert_id")
        .and_then(Value::as_str)
        .map(deliberation_events_model::ExpertId::new)
}
