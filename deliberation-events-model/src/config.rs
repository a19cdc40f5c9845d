use std::time::Duration;

/// Tunables for the batch persister, retry queue, and transient store.
///
/// Field names and defaults mirror the recognised environment variables
/// documented for this pipeline (`BATCH_WINDOW_MS`, `BATCH_MAX`, ...); the
/// loader that maps env vars onto this struct lives in the config crate.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    pub batch_window_ms: u64,
    pub batch_max: usize,
    pub buffer_cap: usize,
    pub persist_workers: usize,
    pub retry_max_attempts: u32,
    pub retry_delays_seconds: Vec<u64>,
    pub transient_ttl_seconds: u64,
    pub dlq_warn_threshold: u64,
    pub dlq_critical_threshold: u64,
    pub immediate_retry_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 50,
            batch_max: 100,
            buffer_cap: 500,
            persist_workers: 15,
            retry_max_attempts: 5,
            retry_delays_seconds: vec![60, 120, 300, 600, 1800],
            transient_ttl_seconds: 604_800,
            dlq_warn_threshold: 10,
            dlq_critical_threshold: 50,
            immediate_retry_attempts: 3,
        }
    }
}

impl PipelineConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn transient_ttl(&self) -> Duration {
        Duration::from_secs(self.transient_ttl_seconds)
    }

    /// Delay before the retry attempt numbered `retry_count` (0-based),
    /// falling back to the last configured delay if the schedule is shorter
    /// than `retry_max_attempts`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let idx = (retry_count as usize).min(self.retry_delays_seconds.len().saturating_sub(1));
        let secs = self.retry_delays_seconds.get(idx).copied().unwrap_or(1800);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.batch_window_ms, 50);
        assert_eq!(cfg.batch_max, 100);
        assert_eq!(cfg.buffer_cap, 500);
        assert_eq!(cfg.persist_workers, 15);
        assert_eq!(cfg.retry_max_attempts, 5);
        assert_eq!(cfg.retry_delays_seconds, vec![60, 120, 300, 600, 1800]);
    }

    #[test]
    fn retry_delay_clamps_to_last_entry() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.retry_delay(0).as_secs(), 60);
        assert_eq!(cfg.retry_delay(4).as_secs(), 1800);
        assert_eq!(cfg.retry_delay(99).as_secs(), 1800);
    }
}
