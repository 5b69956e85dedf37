//! Replay Run Configuration
//!
//! Loaded once before a run (TOML file, then environment / CLI overrides applied by the
//! binary) and never mutated afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ReplayError;
use crate::replay::extract::ExtractionStrategy;

/// Token that precedes every captured request payload in the service logs.
pub const DEFAULT_MARKER: &str = "getInputJson:";

/// Main configuration for a replay run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Directory holding the captured log files (not searched recursively)
    pub log_dir: PathBuf,

    /// Decision service endpoint every payload is POSTed to
    pub service_url: String,

    /// How payloads are located in log text
    pub extraction: ExtractionConfig,

    /// Worker pool sizing
    pub pool: PoolConfig,

    /// Per-request HTTP behaviour
    pub client: ClientConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            service_url: String::new(),
            extraction: ExtractionConfig::default(),
            pool: PoolConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl ReplayConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse replay configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ReplayError> {
        let invalid = |msg: &str| Err(ReplayError::InvalidConfig(msg.to_string()));

        if self.service_url.trim().is_empty() {
            return invalid("service_url must be set");
        }
        if self.log_dir.as_os_str().is_empty() {
            return invalid("log_dir must be set");
        }
        if self.extraction.marker.is_empty() {
            return invalid("extraction.marker must not be empty");
        }
        if self.pool.batch_size == 0 {
            return invalid("pool.batch_size must be at least 1");
        }
        if self.pool.min_workers == 0 {
            return invalid("pool.min_workers must be at least 1");
        }
        if self.pool.max_workers < self.pool.min_workers {
            return invalid("pool.max_workers must not be below pool.min_workers");
        }
        if self.pool.queue_capacity == 0 {
            return invalid("pool.queue_capacity must be at least 1");
        }
        Ok(())
    }
}

/// Payload extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub marker: String,
    pub strategy: ExtractionStrategy,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            strategy: ExtractionStrategy::default(),
        }
    }
}

/// Worker pool sizing.
///
/// The pool starts `min_workers` workers and only grows (up to `max_workers`) when the
/// pending queue is full.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Batches that may wait for a worker before submission is rejected
    pub queue_capacity: usize,
    /// Records per batch (one batch = one unit of pool work)
    pub batch_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 8,
            max_workers: 32,
            queue_capacity: 1024,
            batch_size: 5,
        }
    }
}

/// Per-request HTTP behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
    /// Pause after every exchange before the worker moves on. Zero disables it.
    #[serde(with = "duration_serde")]
    pub post_request_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(1000),
            post_request_delay: Duration::from_millis(100),
        }
    }
}

// Serde helper for Duration (using milliseconds for simplicity)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplayConfig::default();
        assert_eq!(config.extraction.marker, "getInputJson:");
        assert_eq!(config.extraction.strategy, ExtractionStrategy::Balanced);
        assert_eq!(config.pool.batch_size, 5);
        assert_eq!(config.pool.min_workers, 8);
        assert_eq!(config.pool.max_workers, 32);
        assert_eq!(config.client.connect_timeout, Duration::from_millis(1000));
        assert_eq!(config.client.read_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ReplayConfig::from_toml_str(
            r#"
            log_dir = "/data/fraud/logs"
            service_url = "http://decision.internal:8080/fraud/check"

            [pool]
            batch_size = 10

            [client]
            post_request_delay = 0

            [extraction]
            strategy = "legacy"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_dir, PathBuf::from("/data/fraud/logs"));
        assert_eq!(config.pool.batch_size, 10);
        assert_eq!(config.pool.queue_capacity, 1024);
        assert_eq!(config.client.post_request_delay, Duration::ZERO);
        assert_eq!(config.client.read_timeout, Duration::from_millis(1000));
        assert_eq!(config.extraction.strategy, ExtractionStrategy::Legacy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizing() {
        let mut config = ReplayConfig {
            service_url: "http://localhost:8080".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.pool.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ReplayError::InvalidConfig(_))
        ));

        config.pool.batch_size = 5;
        config.pool.max_workers = 4;
        assert!(config.validate().is_err());

        config.pool.max_workers = 32;
        config.service_url = "  ".into();
        assert!(config.validate().is_err());
    }
}
