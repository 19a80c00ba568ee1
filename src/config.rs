use serde::{Deserialize, Serialize};

use crate::defaults::{CHUNK_SIZE, PROGRESS_CAPACITY, RECORD_CAP};

/// Engine-wide limits. The record cap and chunk size are fixed per deployment,
/// never derived from the data being queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub record_cap: usize,
    pub chunk_size: usize,
    /// Partitions for the distance filter fan-out.
    pub workers: usize,
    pub progress_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            record_cap: RECORD_CAP,
            chunk_size: CHUNK_SIZE,
            workers: num_cpus::get().max(1),
            progress_capacity: PROGRESS_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            record_cap: env_usize("PROXIMITY_RECORD_CAP", defaults.record_cap),
            chunk_size: env_usize("PROXIMITY_CHUNK_SIZE", defaults.chunk_size),
            workers: env_usize("PROXIMITY_WORKERS", defaults.workers),
            progress_capacity: defaults.progress_capacity,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    parse_positive(key, std::env::var(key).ok().as_deref(), default)
}

fn parse_positive(key: &str, raw: Option<&str>, default: usize) -> usize {
    match raw.map(|v| v.trim().parse::<usize>()) {
        None => default,
        Some(Ok(value)) if value > 0 => value,
        Some(_) => {
            tracing::warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.record_cap, 50_000);
        assert_eq!(config.chunk_size, 400);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_parse_positive() {
        assert_eq!(parse_positive("K", None, 7), 7);
        assert_eq!(parse_positive("K", Some(" 12 "), 7), 12);
        assert_eq!(parse_positive("K", Some("0"), 7), 7);
        assert_eq!(parse_positive("K", Some("lots"), 7), 7);
    }

    #[test]
    fn test_workers_never_zero() {
        assert_eq!(EngineConfig::default().with_workers(0).workers, 1);
    }
}
