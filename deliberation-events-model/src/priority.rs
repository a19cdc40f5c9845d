use std::fmt;

/// Persistence priority assigned to an event type.
///
/// Critical events bypass the batch buffer entirely; normal and low events
/// are coalesced by the batch persister, with low being first to drop under
/// buffer pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventPriority {
    Low,
    Normal,
    Critical,
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventPriority::Low => "low",
            EventPriority::Normal => "normal",
            EventPriority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Classifies an `event_type` string into its persistence priority.
///
/// The mapping is fixed and owned by the publisher; batching and merging
/// consult it but never redefine it. Unknown event types default to
/// `Normal` so that a producer introducing a new type degrades gracefully
/// rather than silently losing critical-path guarantees.
pub fn classify(event_type: &str) -> EventPriority {
    match event_type {
        "error"
        | "persistence_error"
        | "session_complete"
        | "deliberation_complete"
        | "synthesis_complete"
        | "facilitator_decision"
        | "round_complete" => EventPriority::Critical,

        "status_update" | "progress" | "working_status" | "heartbeat" => {
            EventPriority::Low
        }

        _ => EventPriority::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_events_classify_as_critical() {
        assert_eq!(classify("error"), EventPriority::Critical);
        assert_eq!(classify("synthesis_complete"), EventPriority::Critical);
    }

    #[test]
    fn low_chatter_events_classify_as_low() {
        assert_eq!(classify("working_status"), EventPriority::Low);
    }

    #[test]
    fn unknown_event_types_default_to_normal() {
        assert_eq!(classify("contribution"), EventPriority::Normal);
        assert_eq!(classify("something_new"), EventPriority::Normal);
    }
}
