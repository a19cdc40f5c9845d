use std::sync::Mutex;

use dashmap::DashMap;
use deliberation_events_model::{Envelope, SessionId};
use tokio::sync::broadcast;

const DEFAULT_BACKLOG: usize = 256;

/// Per-session topic broadcaster for live subscribers.
///
/// One `broadcast::Sender` per session, created lazily on first publish or
/// subscribe. A subscriber that falls behind the backlog bound is dropped
/// (per `broadcast`'s lagged-receiver semantics) rather than reordered or
/// buffered without limit.
#[derive(Debug)]
pub struct PubSubBus {
    topics: DashMap<SessionId, broadcast::Sender<Envelope>>,
    backlog: usize,
    // Guards topic creation so two concurrent first-subscribers for the
    // same session cannot race into creating two independent channels.
    creation_lock: Mutex<()>,
}

impl Default for PubSubBus {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

impl PubSubBus {
    pub fn new(backlog: usize) -> Self {
        Self {
            topics: DashMap::new(),
            backlog,
            creation_lock: Mutex::new(()),
        }
    }

    fn topic(&self, session_id: &SessionId) -> broadcast::Sender<Envelope> {
        if let Some(sender) = self.topics.get(session_id) {
            return sender.clone();
        }
        let _guard = self.creation_lock.lock().unwrap();
        self.topics
            .entry(session_id.clone())
            .or_insert_with(|| broadcast::channel(self.backlog).0)
            .clone()
    }

    /// Publishes `envelope` to its session's topic. Never blocks on slow
    /// subscribers; if nobody is listening the send is simply dropped.
    pub fn publish(&self, envelope: Envelope) {
        let sender = self.topic(&envelope.session_id);
        let _ = sender.send(envelope);
    }

    /// Subscribes to live updates for `session_id`.
    pub fn subscribe(&self, session_id: &SessionId) -> broadcast::Receiver<Envelope> {
        self.topic(session_id).subscribe()
    }

    pub fn receiver_count(&self, session_id: &SessionId) -> usize {
        self.topics
            .get(session_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deliberation_events_model::Sequence;
    use serde_json::json;

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
    async fn subscriber_receives_published_envelopes_in_order() {
        let bus = PubSubBus::default();
        let session = SessionId::new("s1");
        let mut rx = bus.subscribe(&session);

        bus.publish(envelope("s1", 1));
        bus.publish(envelope("s1", 2));

        assert_eq!(rx.recv().await.unwrap().sequence.value(), 1);
        assert_eq!(rx.recv().await.unwrap().sequence.value(), 2);
    }

    #[tokio::test]
    async fn sessions_do_not_cross_deliver() {
        let bus = PubSubBus::default();
        let mut rx_a = bus.subscribe(&SessionId::new("a"));
        let _rx_b = bus.subscribe(&SessionId::new("b"));

        bus.publish(envelope("a", 1));
        assert_eq!(rx_a.recv().await.unwrap().sequence.value(), 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = PubSubBus::default();
        bus.publish(envelope("nobody-listening", 1));
    }
}
