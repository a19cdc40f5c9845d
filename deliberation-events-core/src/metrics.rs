use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Consecutive downstream failures before a circuit is reported open. Reset
/// to closed on the next success.
const CIRCUIT_FAILURE_THRESHOLD: u64 = 3;

/// Hand-rolled counters, gauges, and count/sum latency accumulators for
/// operator visibility.
///
/// This deliberately avoids a metrics-exporter dependency: every field is a
/// plain atomic (or a keyed map of them), and [`PipelineMetrics::snapshot`]
/// returns a serializable struct an HTTP adapter can expose however it
/// likes. Latency fields are a count/sum pair rather than real histogram
/// buckets, which is enough to derive an average without pulling in a
/// bucketing dependency the rest of this codebase does not use.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_published: AtomicU64,
    publish_by_type: DashMap<String, AtomicU64>,
    publish_latency_count: AtomicU64,
    publish_latency_sum_micros: AtomicU64,
    events_persisted: AtomicU64,
    batch_flushes: AtomicU64,
    batch_flush_events: AtomicU64,
    batch_flush_latency_count: AtomicU64,
    batch_flush_latency_sum_micros: AtomicU64,
    dropped_on_pressure: AtomicU64,
    retry_success: AtomicU64,
    retry_failure: AtomicU64,
    dead_lettered: AtomicU64,
    transient_store_errors: AtomicU64,
    store_fallback_reads: AtomicU64,
    expert_merges: AtomicU64,
    transient_consecutive_failures: AtomicU64,
    transient_circuit_open: AtomicBool,
    permanent_consecutive_failures: AtomicU64,
    permanent_circuit_open: AtomicBool,
}

/// A point-in-time read of every counter/gauge this pipeline tracks.
///
/// [`PipelineMetrics::snapshot`] fills in everything derivable from its own
/// atomics; [`crate::pipeline::EventPipeline::metrics`] additionally fills
/// in `pending_events`, `retry_queue_depth`, and `dlq_depth`, which live in
/// the batch buffer and the transient store rather than in this struct.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_published_by_type: HashMap<String, u64>,
    pub publish_latency_avg_micros: Option<u64>,
    pub events_persisted: u64,
    pub batch_flushes: u64,
    pub batch_flush_events: u64,
    pub batch_flush_latency_avg_micros: Option<u64>,
    pub pending_events: u64,
    pub dropped_on_pressure: u64,
    pub retry_queue_depth: u64,
    pub dlq_depth: u64,
    pub retry_success: u64,
    pub retry_failure: u64,
    pub dead_lettered: u64,
    pub transient_store_errors: u64,
    pub store_fallback_reads: u64,
    pub expert_merges: u64,
    pub transient_circuit_open: bool,
    pub permanent_circuit_open: bool,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a publish of `event_type`, both in the aggregate counter and
    /// the per-type breakdown.
    pub fn record_published(&self, event_type: &str) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.publish_by_type
            .entry(event_type.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records the wall time spent in a single `publish` call, from entry
    /// to the point persistence has been handed off (not completed).
    pub fn record_publish_latency(&self, latency: Duration) {
        self.publish_latency_count.fetch_add(1, Ordering::Relaxed);
        self.publish_latency_sum_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, count: u64) {
        self.events_persisted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch_flush(&self, batch_size: u64, latency: Duration) {
        self.batch_flushes.fetch_add(1, Ordering::Relaxed);
        self.batch_flush_events.fetch_add(batch_size, Ordering::Relaxed);
        self.batch_flush_latency_count.fetch_add(1, Ordering::Relaxed);
        self.batch_flush_latency_sum_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_on_pressure(&self) {
        self.dropped_on_pressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_success(&self) {
        self.retry_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_failure(&self) {
        self.retry_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed transient-store write, tripping the transient
    /// circuit-breaker gauge after [`CIRCUIT_FAILURE_THRESHOLD`] consecutive
    /// failures.
    pub fn record_transient_store_error(&self) {
        self.transient_store_errors.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.transient_consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= CIRCUIT_FAILURE_THRESHOLD {
            self.transient_circuit_open.store(true, Ordering::Relaxed);
        }
    }

    /// Records a successful transient-store write, closing the transient
    /// circuit-breaker gauge.
    pub fn record_transient_store_success(&self) {
        self.transient_consecutive_failures.store(0, Ordering::Relaxed);
        self.transient_circuit_open.store(false, Ordering::Relaxed);
    }

    /// Records a failed permanent-store write, tripping the permanent
    /// circuit-breaker gauge after [`CIRCUIT_FAILURE_THRESHOLD`] consecutive
    /// failures.
    pub fn record_permanent_failure(&self) {
        let consecutive = self.permanent_consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= CIRCUIT_FAILURE_THRESHOLD {
            self.permanent_circuit_open.store(true, Ordering::Relaxed);
        }
    }

    /// Records a successful permanent-store write, closing the permanent
    /// circuit-breaker gauge.
    pub fn record_permanent_success(&self) {
        self.permanent_consecutive_failures.store(0, Ordering::Relaxed);
        self.permanent_circuit_open.store(false, Ordering::Relaxed);
    }

    /// Records a consumer replay falling back from the transient store to
    /// the permanent store.
    pub fn record_store_fallback_read(&self) {
        self.store_fallback_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expert_merge(&self) {
        self.expert_merges.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of everything this struct tracks directly. Callers that also
    /// want `pending_events`/`retry_queue_depth`/`dlq_depth` must fill those
    /// in separately (see [`crate::pipeline::EventPipeline::metrics`]).
    pub fn snapshot(&self) -> MetricsSnapshot {
        let publish_latency_count = self.publish_latency_count.load(Ordering::Relaxed);
        let batch_flush_latency_count = self.batch_flush_latency_count.load(Ordering::Relaxed);

        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_published_by_type: self
                .publish_by_type
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            publish_latency_avg_micros: avg(publish_latency_count, self.publish_latency_sum_micros.load(Ordering::Relaxed)),
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            batch_flushes: self.batch_flushes.load(Ordering::Relaxed),
            batch_flush_events: self.batch_flush_events.load(Ordering::Relaxed),
            batch_flush_latency_avg_micros: avg(
                batch_flush_latency_count,
                self.batch_flush_latency_sum_micros.load(Ordering::Relaxed),
            ),
            pending_events: 0,
            dropped_on_pressure: self.dropped_on_pressure.load(Ordering::Relaxed),
            retry_queue_depth: 0,
            dlq_depth: 0,
            retry_success: self.retry_success.load(Ordering::Relaxed),
            retry_failure: self.retry_failure.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            transient_store_errors: self.transient_store_errors.load(Ordering::Relaxed),
            store_fallback_reads: self.store_fallback_reads.load(Ordering::Relaxed),
            expert_merges: self.expert_merges.load(Ordering::Relaxed),
            transient_circuit_open: self.transient_circuit_open.load(Ordering::Relaxed),
            permanent_circuit_open: self.permanent_circuit_open.load(Ordering::Relaxed),
        }
    }
}

fn avg(count: u64, sum: u64) -> Option<u64> {
    if count == 0 {
        None
    } else {
        Some(sum / count)
    }
}

/// Logs at warning/critical severity once the DLQ depth crosses the
/// configured thresholds. Pure function of the depth and thresholds so it
/// can be unit tested without a live store.
pub fn check_dlq_alerts(depth: u64, warn_threshold: u64, critical_threshold: u64) {
    if depth >= critical_threshold {
        tracing::error!(depth, critical_threshold, "dead letter queue depth critical");
    } else if depth >= warn_threshold {
        tracing::warn!(depth, warn_threshold, "dead letter queue depth elevated");
    }
}
