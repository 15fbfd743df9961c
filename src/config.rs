// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the channel engine.
//!
//! Configuration is constructed programmatically or deserialized by the
//! host (YAML/JSON/TOML); loading it from files or the environment is the
//! host's business.
//!
//! # Quick Start
//!
//! ```rust
//! use channel_engine::config::{EngineConfig, ConsumerConfig};
//!
//! let config = EngineConfig {
//!     consumer: ConsumerConfig {
//!         poll_batch_size: 250,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── consumer: ConsumerConfig       # Shard polling and error tolerance
//! ├── publisher: PublisherConfig     # Batch size and retry backoff
//! └── compaction: CompactionConfig   # Sync threshold, snapshot layout
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! consumer:
//!   poll_batch_size: 100
//!   poll_interval: "200ms"
//!   max_consecutive_errors: 5
//! publisher:
//!   max_batch_size: 500
//!   max_attempts: 3
//!   initial_backoff: "1s"
//! compaction:
//!   sync_threshold: "10s"
//!   snapshot_prefix: "snapshots/"
//!   replay_mode: bootstrap
//!   merge_strategy: object_merge
//! ```

use crate::compaction::{MergeStrategy, ReplayMode};
use crate::error::{ChannelError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object handed to [`ChannelContext`](crate::context::ChannelContext).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl EngineConfig {
    /// Fast timings for tests.
    pub fn for_testing() -> Self {
        Self {
            consumer: ConsumerConfig::for_testing(),
            publisher: PublisherConfig::for_testing(),
            compaction: CompactionConfig::default(),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.consumer.poll_batch_size == 0 {
            return Err(ChannelError::Config("consumer.poll_batch_size must be > 0".into()));
        }
        if self.consumer.max_consecutive_errors == 0 {
            return Err(ChannelError::Config(
                "consumer.max_consecutive_errors must be > 0".into(),
            ));
        }
        if self.publisher.max_batch_size == 0 {
            return Err(ChannelError::Config("publisher.max_batch_size must be > 0".into()));
        }
        if self.publisher.max_attempts == 0 {
            return Err(ChannelError::Config("publisher.max_attempts must be > 0".into()));
        }
        if self.publisher.backoff_factor < 1.0 {
            return Err(ChannelError::Config("publisher.backoff_factor must be >= 1.0".into()));
        }
        for (name, value) in [
            ("consumer.poll_interval", &self.consumer.poll_interval),
            ("consumer.error_backoff", &self.consumer.error_backoff),
            ("publisher.initial_backoff", &self.publisher.initial_backoff),
            ("compaction.sync_threshold", &self.compaction.sync_threshold),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                ChannelError::Config(format!("{} '{}' is not a duration: {}", name, value, e))
            })?;
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig: shard polling
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumption engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum records requested per poll.
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,

    /// Sleep after an empty poll of a log shard (e.g., "200ms").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Consecutive transport errors after which a shard fails.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: usize,

    /// Backoff after the first transport error; doubles per consecutive error.
    #[serde(default = "default_error_backoff")]
    pub error_backoff: String,

    /// Ceiling for the error backoff.
    #[serde(default = "default_max_error_backoff")]
    pub max_error_backoff: String,
}

fn default_poll_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "200ms".to_string()
}

fn default_max_consecutive_errors() -> usize {
    5
}

fn default_error_backoff() -> String {
    "500ms".to_string()
}

fn default_max_error_backoff() -> String {
    "30s".to_string()
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_batch_size: default_poll_batch_size(),
            poll_interval: default_poll_interval(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_backoff: default_error_backoff(),
            max_error_backoff: default_max_error_backoff(),
        }
    }
}

impl ConsumerConfig {
    pub fn for_testing() -> Self {
        Self {
            poll_interval: "10ms".to_string(),
            error_backoff: "5ms".to_string(),
            max_error_backoff: "50ms".to_string(),
            ..Default::default()
        }
    }

    /// Parse the poll_interval string to a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_millis(200))
    }

    /// Backoff between consecutive transport errors on one shard.
    pub fn error_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_consecutive_errors,
            initial_delay: humantime::parse_duration(&self.error_backoff)
                .unwrap_or(Duration::from_millis(500)),
            max_delay: humantime::parse_duration(&self.max_error_backoff)
                .unwrap_or(Duration::from_secs(30)),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PublisherConfig: reliable batch publish
// ═══════════════════════════════════════════════════════════════════════════════

/// Reliable batch publisher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Upper bound on records per sub-batch. The transport's own maximum
    /// applies if it is smaller.
    #[serde(default = "default_publish_batch_size")]
    pub max_batch_size: usize,

    /// Attempts per sub-batch, including the first submission.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Delay before the first resubmission (e.g., "1s").
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,

    /// Ceiling for the resubmission delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Compress envelopes with zstd.
    #[serde(default)]
    pub compress: bool,
}

fn default_publish_batch_size() -> usize {
    500
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff() -> String {
    "1s".to_string()
}

fn default_max_backoff() -> String {
    "30s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_publish_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            compress: false,
        }
    }
}

impl PublisherConfig {
    pub fn for_testing() -> Self {
        Self {
            initial_backoff: "5ms".to_string(),
            max_backoff: "50ms".to_string(),
            ..Default::default()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: humantime::parse_duration(&self.initial_backoff)
                .unwrap_or(Duration::from_secs(1)),
            max_delay: humantime::parse_duration(&self.max_backoff)
                .unwrap_or(Duration::from_secs(30)),
            backoff_factor: self.backoff_factor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CompactionConfig: snapshot compaction
// ═══════════════════════════════════════════════════════════════════════════════

/// Compaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// A shard stops replaying once its known lag is within this threshold.
    #[serde(default = "default_sync_threshold")]
    pub sync_threshold: String,

    /// Object-store key prefix for snapshots and their `latest` pointers.
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    #[serde(default)]
    pub replay_mode: ReplayMode,

    #[serde(default)]
    pub merge_strategy: MergeStrategy,

    /// Compress snapshot bodies with zstd.
    #[serde(default = "default_true")]
    pub compress: bool,
}

fn default_sync_threshold() -> String {
    "10s".to_string()
}

fn default_snapshot_prefix() -> String {
    "snapshots/".to_string()
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            sync_threshold: default_sync_threshold(),
            snapshot_prefix: default_snapshot_prefix(),
            replay_mode: ReplayMode::default(),
            merge_strategy: MergeStrategy::default(),
            compress: true,
        }
    }
}

impl CompactionConfig {
    /// Parse the sync_threshold string to a Duration.
    pub fn sync_threshold_duration(&self) -> Duration {
        humantime::parse_duration(&self.sync_threshold).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.poll_batch_size, 100);
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(200));
        assert_eq!(config.max_consecutive_errors, 5);
    }

    #[test]
    fn test_poll_interval_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
        ];

        for (input, expected) in test_cases {
            let config = ConsumerConfig {
                poll_interval: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.poll_interval_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_durations_fall_back() {
        let consumer = ConsumerConfig {
            poll_interval: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(consumer.poll_interval_duration(), Duration::from_millis(200));

        let compaction = CompactionConfig {
            sync_threshold: "invalid".to_string(),
            ..Default::default()
        };
        assert_eq!(compaction.sync_threshold_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_error_retry_config() {
        let retry = ConsumerConfig::default().error_retry_config();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(1));
    }

    #[test]
    fn test_publisher_retry_config() {
        let retry = PublisherConfig::default().retry_config();
        assert_eq!(retry, RetryConfig::publisher());
    }

    #[test]
    fn test_compaction_defaults() {
        let config = CompactionConfig::default();
        assert_eq!(config.sync_threshold_duration(), Duration::from_secs(10));
        assert_eq!(config.snapshot_prefix, "snapshots/");
        assert_eq!(config.replay_mode, ReplayMode::Full);
        assert_eq!(config.merge_strategy, MergeStrategy::Replace);
        assert!(config.compress);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::for_testing().validate().is_ok());

        let mut config = EngineConfig::default();
        config.consumer.poll_batch_size = 0;
        assert!(matches!(config.validate(), Err(ChannelError::Config(_))));

        let mut config = EngineConfig::default();
        config.compaction.sync_threshold = "whenever".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("compaction.sync_threshold"));

        let mut config = EngineConfig::default();
        config.publisher.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"compaction": {"replay_mode": "bootstrap", "merge_strategy": "object_merge"}}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.compaction.replay_mode, ReplayMode::Bootstrap);
        assert_eq!(config.compaction.merge_strategy, MergeStrategy::ObjectMerge);
        assert_eq!(config.compaction.snapshot_prefix, "snapshots/");
        assert_eq!(config.consumer.poll_batch_size, 100);
        assert_eq!(config.publisher.max_batch_size, 500);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = EngineConfig::for_testing();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.consumer.poll_interval, "10ms");
        assert_eq!(parsed.publisher.initial_backoff, "5ms");
    }
}
