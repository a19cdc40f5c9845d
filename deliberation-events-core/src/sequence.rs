use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use deliberation_events_model::{Sequence, SessionId};

/// In-memory, per-session monotone sequence generator.
///
/// The counter is process-local: it does not coordinate across replicas of
/// this pipeline. Cold-start recovery (seeding a counter from the highest
/// sequence already in the permanent store) is the caller's responsibility,
/// via [`SequenceCounter::prime`].
#[derive(Debug, Default)]
pub struct SequenceCounter {
    counters: DashMap<SessionId, Arc<AtomicU64>>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence for `session_id`, starting at 1.
    pub fn next(&self, session_id: &SessionId) -> Sequence {
        let counter = self
            .counters
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        Sequence(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Seeds the counter for `session_id` so the next call to [`Self::next`]
    /// returns `highest + 1`. Used on cold start once the caller has read
    /// the highest persisted sequence for the session.
    pub fn prime(&self, session_id: &SessionId, highest: u64) {
        self.counters
            .entry(session_id.clone())
            .and_modify(|c| {
                let current = c.load(Ordering::SeqCst);
                if highest > current {
                    c.store(highest, Ordering::SeqCst);
                }
            })
            .or_insert_with(|| Arc::new(AtomicU64::new(highest)));
    }
}
