//! Environment-variable loader for [`PipelineConfig`], with `.env` support
//! for local development. Every variable is optional; absence falls back to
//! the defaults documented on [`PipelineConfig::default`].
#![warn(missing_docs)]

use deliberation_events_model::PipelineConfig;
use thiserror::Error;

/// Failure loading or validating the pipeline's tunables from the
/// environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable {name} has invalid value {value:?}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{name} must be greater than zero, got {value}")]
    MustBePositive { name: &'static str, value: u64 },
}

/// Loads a `.env` file from the working directory if present, then builds a
/// [`PipelineConfig`] from environment variables layered over the documented
/// defaults. A missing `.env` file is not an error; a malformed one is
/// logged and ignored, matching this codebase's local-dev conventions.
pub fn load() -> Result<PipelineConfig, ConfigError> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            tracing::warn!(error = %err, ".env file present but unreadable, ignoring");
        }
    }
    from_env()
}

/// Builds a [`PipelineConfig`] purely from whatever is already set in the
/// process environment, without touching `.env`. Split out from [`load`] so
/// tests can exercise the parsing logic with `temp_env`-style scoped vars.
pub fn from_env() -> Result<PipelineConfig, ConfigError> {
    let defaults = PipelineConfig::default();

    let config = PipelineConfig {
        batch_window_ms: parse_u64("BATCH_WINDOW_MS", defaults.batch_window_ms)?,
        batch_max: parse_usize("BATCH_MAX", defaults.batch_max)?,
        buffer_cap: parse_usize("BUFFER_CAP", defaults.buffer_cap)?,
        persist_workers: parse_usize("PERSIST_WORKERS", defaults.persist_workers)?,
        retry_max_attempts: parse_u32("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
        retry_delays_seconds: parse_delay_list("RETRY_DELAYS_SECONDS", defaults.retry_delays_seconds)?,
        transient_ttl_seconds: parse_u64("TRANSIENT_TTL_SECONDS", defaults.transient_ttl_seconds)?,
        dlq_warn_threshold: parse_u64("DLQ_WARN_THRESHOLD", defaults.dlq_warn_threshold)?,
        dlq_critical_threshold: parse_u64("DLQ_CRITICAL_THRESHOLD", defaults.dlq_critical_threshold)?,
        immediate_retry_attempts: parse_u32(
            "IMMEDIATE_RETRY_ATTEMPTS",
            defaults.immediate_retry_attempts,
        )?,
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.batch_max == 0 {
        return Err(ConfigError::MustBePositive {
            name: "BATCH_MAX",
            value: 0,
        });
    }
    if config.buffer_cap == 0 {
        return Err(ConfigError::MustBePositive {
            name: "BUFFER_CAP",
            value: 0,
        });
    }
    if config.persist_workers == 0 {
        return Err(ConfigError::MustBePositive {
            name: "PERSIST_WORKERS",
            value: 0,
        });
    }
    if config.dlq_critical_threshold < config.dlq_warn_threshold {
        return Err(ConfigError::InvalidValue {
            name: "DLQ_CRITICAL_THRESHOLD",
            value: config.dlq_critical_threshold.to_string(),
            reason: "must be >= DLQ_WARN_THRESHOLD".to_string(),
        });
    }
    Ok(())
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
            reason: "expected an unsigned integer".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
            reason: "expected an unsigned integer".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
            reason: "expected an unsigned integer".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_delay_list(name: &'static str, default: Vec<u64>) -> Result<Vec<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let mut delays = Vec::new();
            for part in raw.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let secs: u64 = part.parse().map_err(|_| ConfigError::InvalidValue {
                    name,
                    value: raw.clone(),
                    reason: format!("expected a comma-separated list of integers, got {part:?}"),
                })?;
                delays.push(secs);
            }
            if delays.is_empty() {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: raw,
                    reason: "must contain at least one delay".to_string(),
                });
            }
            Ok(delays)
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // std::env is process-global; serialize tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn absent_vars_fall_back_to_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = from_env().unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn overrides_are_applied_and_validated() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("BATCH_MAX", "250");
            std::env::set_var("RETRY_DELAYS_SECONDS", "5, 10 ,20");
        }
        let config = from_env().unwrap();
        assert_eq!(config.batch_max, 250);
        assert_eq!(config.retry_delays_seconds, vec![5, 10, 20]);
        unsafe {
            std::env::remove_var("BATCH_MAX");
            std::env::remove_var("RETRY_DELAYS_SECONDS");
        }
    }

    #[test]
    fn zero_batch_max_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("BATCH_MAX", "0");
        }
        let result = from_env();
        unsafe {
            std::env::remove_var("BATCH_MAX");
        }
        assert!(matches!(result, Err(ConfigError::MustBePositive { name: "BATCH_MAX", .. })));
    }

    #[test]
    fn dlq_critical_below_warn_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("DLQ_WARN_THRESHOLD", "50");
            std::env::set_var("DLQ_CRITICAL_THRESHOLD", "10");
        }
        let result = from_env();
        unsafe {
            std::env::remove_var("DLQ_WARN_THRESHOLD");
            std::env::remove_var("DLQ_CRITICAL_THRESHOLD");
        }
        assert!(matches!(result, Err(ConfigError::InvalidValue { name: "DLQ_CRITICAL_THRESHOLD", .. })));
    }
}
