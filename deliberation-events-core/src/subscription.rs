use std::sync::Arc;

use deliberation_events_contracts::{PermanentStore, TransientStore};
use deliberation_events_model::{Envelope, EventCursor, Sequence, SessionId};
use tokio::sync::broadcast;
use tokio_stream::Stream;

use crate::metrics::PipelineMetrics;
use crate::pubsub::PubSubBus;

/// Opens a replay-then-live stream for `session_id`.
///
/// Subscribes to the live topic first, then replays everything after
/// `since_sequence` from the transient history (falling back to the
/// permanent store if the transient store is empty or unreachable), and
/// finally forwards whatever arrives on the live topic. Envelopes replayed
/// after the live subscription opened may also arrive a second time via the
/// live topic; consumers dedup on `sequence`, per the documented
/// replay-to-live seam.
pub fn subscribe(
    transient: Arc<dyn TransientStore>,
    permanent: Arc<dyn PermanentStore>,
    pubsub: Arc<PubSubBus>,
    metrics: Arc<PipelineMetrics>,
    session_id: SessionId,
    since_sequence: Sequence,
) -> impl Stream<Item = Envelope> {
    async_stream::stream! {
        let mut live_rx = pubsub.subscribe(&session_id);

        let replay = replay_since(transient.as_ref(), permanent.as_ref(), metrics.as_ref(), &session_id, since_sequence).await;
        for envelope in replay {
            yield envelope;
        }

        loop {
            match live_rx.recv().await {
                Ok(envelope) => yield envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, session_id = %session_id, "subscriber lagged, dropping backlog");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn replay_since(
    transient: &dyn TransientStore,
    permanent: &dyn PermanentStore,
    metrics: &PipelineMetrics,
    session_id: &SessionId,
    since: Sequence,
) -> Vec<Envelope> {
    match transient.history_since(session_id, since).await {
        Ok(events) if !events.is_empty() => events,
        Ok(_) => {
            metrics.record_store_fallback_read();
            permanent
                .get_events(session_id, since)
                .await
                .unwrap_or_default()
        }
        Err(err) => {
            tracing::warn!(error = %err, "transient history unavailable, falling back to permanent store");
            metrics.record_store_fallback_read();
            permanent
                .get_events(session_id, since)
                .await
                .unwrap_or_default()
        }
    }
}

/// Stateless recovery of events after `last_event_id`. A malformed cursor
/// is treated as "replay everything" for that session.
pub async fn missed(
    transient: Arc<dyn TransientStore>,
    permanent: Arc<dyn PermanentStore>,
    metrics: Arc<PipelineMetrics>,
    session_id: SessionId,
    last_event_id: Option<&str>,
) -> Vec<Envelope> {
    let since = last_event_id
        .and_then(|raw| raw.parse::<EventCursor>().ok())
        .map(|cursor| cursor.sequence)
        .unwrap_or(Sequence(0));

    replay_since(transient.as_ref(), permanent.as_ref(), metrics.as_ref(), &session_id, since).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryPermanentStore, InMemoryTransientStore};
    use deliberation_events_model::Sequence;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn envelope(session: &str, seq: u64) -> Envelope {
        Envelope::new(
            SessionId::new(session),
            Sequence(seq),
            "contribution",
            chrono::Utc::now(),
            None,
            json!({}),
        )
    }

    #[tokio::test]
    async fn replay_falls_back_to_permanent_store_when_transient_is_empty() {
        let transient: Arc<dyn TransientStore> = Arc::new(InMemoryTransientStore::default());
        let permanent = Arc::new(InMemoryPermanentStore::default());
        permanent.save_event(&envelope("s1", 1)).await.unwrap();
        permanent.save_event(&envelope("s1", 2)).await.unwrap();

        let metrics = Arc::new(crate::metrics::PipelineMetrics::new());
        let missed = missed(
            transient,
            permanent as Arc<dyn PermanentStore>,
            metrics.clone(),
            SessionId::new("s1"),
            None,
        )
        .await;
        assert_eq!(missed.len(), 2);
        assert_eq!(metrics.snapshot().store_fallback_reads, 1);
    }

    #[tokio::test]
    async fn subscribe_replays_then_delivers_live_events() {
        let transient = Arc::new(InMemoryTransientStore::default());
        transient.append(&envelope("s1", 1), 60).await.unwrap();
        let transient: Arc<dyn TransientStore> = transient;
        let permanent: Arc<dyn PermanentStore> = Arc::new(InMemoryPermanentStore::default());
        let pubsub = Arc::new(PubSubBus::default());
        let metrics = Arc::new(crate::metrics::PipelineMetrics::new());

        let stream = subscribe(
            transient,
            permanent,
            pubsub.clone(),
            metrics,
            SessionId::new("s1"),
            Sequence(0),
        );
        tokio::pin!(stream);

        assert_eq!(stream.next().await.unwrap().sequence.value(), 1);

        pubsub.publish(envelope("s1", 2));
        assert_eq!(stream.next().await.unwrap().sequence.value(), 2);
    }
}
