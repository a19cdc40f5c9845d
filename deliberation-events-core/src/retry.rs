use std::sync::Arc;

use deliberation_events_contracts::{Clock, PermanentStore, TransientStore};
use deliberation_events_model::{Envelope, FailedEventRecord, PipelineConfig};

use crate::metrics::{check_dlq_alerts, PipelineMetrics};

/// Scheduled retry of failed persistence attempts, with promotion to the
/// dead letter queue once the retry budget is exhausted.
///
/// Holds no state of its own beyond its collaborators: the retry and DLQ
/// sets live in the transient store (sorted sets, in the Redis-backed
/// implementation) so that [`RetryQueue::scan_tick`] can run from any
/// number of worker tasks without duplicating in-process bookkeeping.
pub struct RetryQueue {
    config: PipelineConfig,
    transient: Arc<dyn TransientStore>,
    permanent: Arc<dyn PermanentStore>,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("config", &self.config)
            .field("transient", &"<dyn TransientStore>")
            .field("permanent", &"<dyn PermanentStore>")
            .field("metrics", &self.metrics)
            .field("clock", &"<dyn Clock>")
            .finish()
    }
}

impl RetryQueue {
    pub fn new(
        config: PipelineConfig,
        transient: Arc<dyn TransientStore>,
        permanent: Arc<dyn PermanentStore>,
        metrics: Arc<PipelineMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            transient,
            permanent,
            metrics,
            clock,
        }
    }

    /// Queues `envelope` for retry after a persistence failure.
    pub async fn enqueue(&self, envelope: Envelope, error: String) {
        let record = FailedEventRecord::new(envelope, error, self.clock.now());
        if let Err(err) = self.transient.enqueue_retry(&record).await {
            tracing::error!(error = %err, "failed to enqueue failed-event record; event is at risk of loss");
            self.metrics.record_transient_store_error();
        }
    }

    /// Claims records due for retry, attempts persistence, and either
    /// clears, reschedules, or dead-letters each one. Returns the number of
    /// records processed.
    #[tracing::instrument(skip(self))]
    pub async fn scan_tick(&self) -> usize {
        let now = self.clock.now();
        let due = match self
            .transient
            .claim_due_retries(now, self.config.persist_workers)
            .await
        {
            Ok(due) => due,
            Err(err) => {
                tracing::warn!(error = %err, "retry scan could not claim due records");
                return 0;
            }
        };

        let processed = due.len();
        for mut record in due {
            match self.permanent.save_event(&record.envelope).await {
                Ok(()) => {
                    self.metrics.record_retry_success();
                    self.metrics.record_persisted(1);
                    self.metrics.record_permanent_success();
                }
                Err(err) => {
                    self.metrics.record_retry_failure();
                    self.metrics.record_permanent_failure();
                    // `retry_delay` is 0-based (delay before the attempt
                    // numbered `retry_count`), so the lookup must use the
                    // pre-increment count.
                    let delay = self.config.retry_delay(record.retry_count);
                    record.retry_count += 1;
                    record.original_error = err.to_string();

                    if record.retry_count >= self.config.retry_max_attempts {
                        record.moved_to_dlq_at = Some(now);
                        tracing::error!(
                            session_id = %record.envelope.session_id,
                            sequence = record.envelope.sequence.value(),
                            "event exhausted retry budget, moving to dead letter queue"
                        );
                        if let Err(err) = self.transient.move_to_dlq(&record).await {
                            tracing::error!(error = %err, "failed to move record to dead letter queue");
                        } else {
                            self.metrics.record_dead_lettered();
                        }
                    } else {
                        record.next_retry_at = now + delay;
                        if let Err(err) = self.transient.reschedule_retry(&record).await {
                            tracing::error!(error = %err, "failed to reschedule retry record");
                        }
                    }
                }
            }
        }

        self.check_alerts().await;
        processed
    }

    async fn check_alerts(&self) {
        if let Ok(depth) = self.transient.dlq_depth().await {
            check_dlq_alerts(
                depth,
                self.config.dlq_warn_threshold,
                self.config.dlq_critical_threshold,
            );
        }
    }

    pub async fn retry_depth(&self) -> u64 {
        self.transient.retry_depth().await.unwrap_or(0)
    }

    pub async fn dlq_depth(&self) -> u64 {
        self.transient.dlq_depth().await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryPermanentStore, InMemoryTransientStore};
    use deliberation_events_contracts::SystemClock;
    use deliberation_events_model::{Sequence, SessionId};
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new(
            SessionId::new("s1"),
            Sequence(1),
            "contribution",
            chrono::Utc::now(),
            None,
            json!({}),
        )
    }

    #[tokio::test]
    async fn succeeding_retry_clears_the_record() {
        let transient = Arc::new(InMemoryTransientStore::default());
        let permanent = Arc::new(InMemoryPermanentStore::default());
        let metrics = Arc::new(PipelineMetrics::new());
        let config = PipelineConfig::default();
        let queue = RetryQueue::new(
            config,
            transient.clone(),
            permanent.clone(),
            metrics.clone(),
            Arc::new(SystemClock),
        );

        queue.enqueue(envelope(), "boom".to_string()).await;
        assert_eq!(queue.retry_depth().await, 1);

        let processed = queue.scan_tick().await;
        assert_eq!(processed, 1);
        assert_eq!(queue.retry_depth().await, 0);
        assert_eq!(queue.dlq_depth().await, 0);
        assert_eq!(permanent.count(&SessionId::new("s1")).await, 1);
    }

    #[tokio::test]
    async fn exhausting_retries_moves_the_record_to_the_dlq() {
        let transient = Arc::new(InMemoryTransientStore::default());
        let permanent = Arc::new(InMemoryPermanentStore::default());
        permanent.always_fail();
        let metrics = Arc::new(PipelineMetrics::new());
        let mut config = PipelineConfig::default();
        config.retry_max_attempts = 2;
        config.retry_delays_seconds = vec![0, 0];
        let queue = RetryQueue::new(
            config,
            transient.clone(),
            permanent.clone(),
            metrics.clone(),
            Arc::new(SystemClock),
        );

        queue.enqueue(envelope(), "boom".to_string()).await;
        queue.scan_tick().await;
        assert_eq!(queue.retry_depth().await, 1);
        queue.scan_tick().await;
        assert_eq!(queue.retry_depth().await, 0);
        assert_eq!(queue.dlq_depth().await, 1);
    }

    #[tokio::test]
    async fn first_failed_attempt_is_rescheduled_using_the_pre_increment_delay() {
        let transient = Arc::new(InMemoryTransientStore::default());
        let permanent = Arc::new(InMemoryPermanentStore::default());
        permanent.always_fail();
        let metrics = Arc::new(PipelineMetrics::new());
        let config = PipelineConfig::default();
        let clock = Arc::new(SystemClock);
        let queue = RetryQueue::new(config.clone(), transient.clone(), permanent.clone(), metrics.clone(), clock.clone());

        let enqueued_at = clock.now();
        queue.enqueue(envelope(), "boom".to_string()).await;
        queue.scan_tick().await;

        let due = transient
            .claim_due_retries(enqueued_at + chrono::Duration::seconds(120), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        let record = &due[0];
        assert_eq!(record.retry_count, 1);

        let expected_delay = config.retry_delay(0);
        assert_eq!(expected_delay.as_secs(), 60);
        let actual_delay = record.next_retry_at - enqueued_at;
        assert_eq!(actual_delay.num_seconds(), expected_delay.as_secs() as i64);
    }
}
