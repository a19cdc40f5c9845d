use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deliberation_events_model::{classify, EventPriority, ExpertId, SessionId};
use serde_json::{Map, Value};

const EXPERT_STARTED: &str = "expert_started";
const EXPERT_REASONING: &str = "expert_reasoning";
const EXPERT_CONCLUSION: &str = "expert_conclusion";
const MERGED_EVENT_TYPE: &str = "expert_contribution_complete";

/// An unpublished sub-event, carrying everything [`crate::pipeline::EventPipeline`]
/// needs to mint a full envelope once the merger decides to emit it.
#[derive(Debug, Clone)]
pub struct SubEventDraft {
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
}

/// Reduces `expert_started` / `expert_reasoning` / `expert_conclusion`
/// triples into a single `expert_contribution_complete` event per expert.
///
/// Buffers are keyed by `(session_id, expert_id)`; a buffer only ever holds
/// a prefix of the pattern currently being assembled for that key. Any
/// event that cannot extend the current prefix flushes the prefix as
/// pass-through drafts before the new event is considered.
#[derive(Debug, Default)]
pub struct ExpertMerger {
    pending: DashMap<(SessionId, ExpertId), Vec<SubEventDraft>>,
}

impl ExpertMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a sub-event for `expert_id` within `session_id`, returning the
    /// drafts ready for immediate emission, in order. An empty result means
    /// the event was absorbed into the buffer and nothing is ready yet.
    /// Critical events always return a single-element result, bypassing the
    /// merger entirely.
    pub fn queue(
        &self,
        session_id: &SessionId,
        expert_id: &ExpertId,
        draft: SubEventDraft,
    ) -> Vec<SubEventDraft> {
        if classify(&draft.event_type) == EventPriority::Critical {
            return vec![draft];
        }

        let key = (session_id.clone(), expert_id.clone());
        let mut entry = self.pending.entry(key).or_default();
        let buffer = entry.value_mut();

        match draft.event_type.as_str() {
            EXPERT_STARTED => {
                let mut ready = std::mem::take(buffer);
                buffer.push(draft);
                ready.shrink_to_fit();
                ready
            }
            EXPERT_REASONING if buffer.len() == 1 && buffer[0].event_type == EXPERT_STARTED => {
                buffer.push(draft);
                Vec::new()
            }
            EXPERT_REASONING => {
                let mut ready = std::mem::take(buffer);
                ready.push(draft);
                ready
            }
            EXPERT_CONCLUSION
                if buffer.len() == 2
                    && buffer[0].event_type == EXPERT_STARTED
                    && buffer[1].event_type == EXPERT_REASONING =>
            {
                let started = buffer.remove(0);
                let reasoning = buffer.remove(0);
                vec![merge_triple(started, reasoning, draft)]
            }
            EXPERT_CONCLUSION => {
                let mut ready = std::mem::take(buffer);
                ready.push(draft);
                ready
            }
            _ => vec![draft],
        }
    }

    /// Drains and returns any buffered-but-unmerged sub-events for every
    /// expert in `session_id`, in queue order, for emission as pass-through
    /// on session close or forced flush.
    pub fn flush_session(&self, session_id: &SessionId) -> Vec<SubEventDraft> {
        let keys: Vec<_> = self
            .pending
            .iter()
            .filter(|entry| &entry.key().0 == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut drained = Vec::new();
        for key in keys {
            if let Some((_, drafts)) = self.pending.remove(&key) {
                drained.extend(drafts);
            }
        }
        drained
    }
}

fn merge_triple(
    started: SubEventDraft,
    reasoning: SubEventDraft,
    conclusion: SubEventDraft,
) -> SubEventDraft {
    let mut merged = Map::new();
    for draft in [&started, &reasoning, &conclusion] {
        if let Value::Object(map) = &draft.data {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    merged.insert("merged".to_string(), Value::Bool(true));

    SubEventDraft {
        event_type: MERGED_EVENT_TYPE.to_string(),
        data: Value::Object(merged),
        timestamp: conclusion.timestamp,
        request_id: started
            .request_id
            .or(reasoning.request_id)
            .or(conclusion.request_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(event_type: &str, data: Value) -> SubEventDraft {
        SubEventDraft {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    #[test]
    fn full_triple_merges_into_single_event() {
        let merger = ExpertMerger::new();
        let session = SessionId::new("s1");
        let expert = ExpertId::new("xyz");

        assert!(merger
            .queue(&session, &expert, draft(EXPERT_STARTED, json!({"a": 1})))
            .is_empty());
        assert!(merger
            .queue(&session, &expert, draft(EXPERT_REASONING, json!({"b": 2})))
            .is_empty());

        let ready = merger.queue(&session, &expert, draft(EXPERT_CONCLUSION, json!({"c": 3})));
        assert_eq!(ready.len(), 1);
        let merged = &ready[0];
        assert_eq!(merged.event_type, MERGED_EVENT_TYPE);
        assert_eq!(merged.data["a"], json!(1));
        assert_eq!(merged.data["b"], json!(2));
        assert_eq!(merged.data["c"], json!(3));
        assert_eq!(merged.data["merged"], json!(true));
    }

    #[test]
    fn non_matching_events_pass_through_unchanged() {
        let merger = ExpertMerger::new();
        let session = SessionId::new("s1");
        let expert = ExpertId::new("xyz");

        let ready = merger.queue(&session, &expert, draft("contribution", json!({})));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].event_type, "contribution");
    }

    #[test]
    fn critical_events_bypass_buffering_entirely() {
        let merger = ExpertMerger::new();
        let session = SessionId::new("s1");
        let expert = ExpertId::new("xyz");

        assert!(merger
            .queue(&session, &expert, draft(EXPERT_STARTED, json!({})))
            .is_empty());
        let ready = merger.queue(&session, &expert, draft("error", json!({"msg": "boom"})));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].event_type, "error");
    }

    #[test]
    fn broken_pattern_flushes_prefix_then_restarts() {
        let merger = ExpertMerger::new();
        let session = SessionId::new("s1");
        let expert = ExpertId::new("xyz");

        assert!(merger
            .queue(&session, &expert, draft(EXPERT_STARTED, json!({"n": 1})))
            .is_empty());
        // A second `expert_started` before reasoning/conclusion arrived
        // flushes the stale prefix and starts a fresh one.
        let ready = merger.queue(&session, &expert, draft(EXPERT_STARTED, json!({"n": 2})));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].data["n"], json!(1));

        let drained = merger.flush_session(&session);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].data["n"], json!(2));
    }

    #[test]
    fn flush_session_drains_partial_buffers() {
        let merger = ExpertMerger::new();
        let session = SessionId::new("s1");
        let expert = ExpertId::new("xyz");

        merger.queue(&session, &expert, draft(EXPERT_STARTED, json!({})));
        let drained = merger.flush_session(&session);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].event_type, EXPERT_STARTED);
        assert!(merger.flush_session(&session).is_empty());
    }
}
