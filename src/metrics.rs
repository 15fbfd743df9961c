// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Shard polling and consumption lag
//! - Consumer dispatch failures
//! - Batch publishing and retries
//! - Compaction runs and snapshots
//! - State repository writes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `channel_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use channel_engine::metrics;
//! use std::time::Duration;
//!
//! // In a shard worker after a poll
//! metrics::record_poll("orders", "shard-0", 42, Duration::from_millis(8));
//!
//! // After a publish call
//! metrics::record_publish("orders", 100, 2, Duration::from_millis(50));
//! ```

use crate::engine::ConsumerState;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Consumption Metrics
// =============================================================================

/// Gauge for consumer state (0=idle .. 5=stopped).
pub fn set_consumer_state(channel: &str, state: ConsumerState) {
    let value = match state {
        ConsumerState::Idle => 0.0,
        ConsumerState::Starting => 1.0,
        ConsumerState::Running => 2.0,
        ConsumerState::Finished => 3.0,
        ConsumerState::Failed => 4.0,
        ConsumerState::Stopped => 5.0,
    };
    gauge!("channel_consumer_state", "channel" => channel.to_string()).set(value);
}

/// Record a shard poll.
pub fn record_poll(channel: &str, shard: &str, records: usize, duration: Duration) {
    counter!("channel_polls_total", "channel" => channel.to_string(), "shard" => shard.to_string())
        .increment(1);
    if records > 0 {
        counter!("channel_records_polled_total", "channel" => channel.to_string(), "shard" => shard.to_string())
            .increment(records as u64);
    }
    histogram!("channel_poll_duration_seconds", "channel" => channel.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed poll.
pub fn record_poll_error(channel: &str, shard: &str) {
    counter!("channel_poll_errors_total", "channel" => channel.to_string(), "shard" => shard.to_string())
        .increment(1);
}

/// Record a record that could not be decoded.
pub fn record_decode_error(channel: &str, shard: &str) {
    counter!("channel_decode_errors_total", "channel" => channel.to_string(), "shard" => shard.to_string())
        .increment(1);
}

/// Record messages handed to the dispatcher.
pub fn record_messages_consumed(channel: &str, shard: &str, count: usize) {
    if count > 0 {
        counter!("channel_messages_consumed_total", "channel" => channel.to_string(), "shard" => shard.to_string())
            .increment(count as u64);
    }
}

/// Gauge for shard lag in seconds; -1 when unknown.
pub fn set_shard_duration_behind(channel: &str, shard: &str, behind: Option<Duration>) {
    let value = behind.map(|d| d.as_secs_f64()).unwrap_or(-1.0);
    gauge!("channel_duration_behind_seconds", "channel" => channel.to_string(), "shard" => shard.to_string())
        .set(value);
}

/// Record a consumer callback failure (logged and swallowed).
pub fn record_consumer_error(channel: &str, consumer: &str) {
    counter!(
        "channel_consumer_errors_total",
        "channel" => channel.to_string(),
        "consumer" => consumer.to_string()
    )
    .increment(1);
}

// =============================================================================
// Publish Metrics
// =============================================================================

/// Record a completed publish call.
pub fn record_publish(channel: &str, records: usize, sub_batches: usize, duration: Duration) {
    counter!("channel_published_records_total", "channel" => channel.to_string())
        .increment(records as u64);
    counter!("channel_published_batches_total", "channel" => channel.to_string())
        .increment(sub_batches as u64);
    histogram!("channel_publish_duration_seconds", "channel" => channel.to_string())
        .record(duration.as_secs_f64());
}

/// Record a resubmission of failed records.
pub fn record_publish_retry(channel: &str, records: usize) {
    counter!("channel_publish_retries_total", "channel" => channel.to_string()).increment(1);
    counter!("channel_publish_retried_records_total", "channel" => channel.to_string())
        .increment(records as u64);
}

/// Record a publish call that gave up.
pub fn record_publish_failure(channel: &str, reason: &str) {
    counter!(
        "channel_publish_failures_total",
        "channel" => channel.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Compaction Metrics
// =============================================================================

/// Record a compaction run.
pub fn record_compaction(channel: &str, success: bool, entries: usize, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("channel_compactions_total", "channel" => channel.to_string(), "status" => status)
        .increment(1);
    if success {
        gauge!("channel_snapshot_entries", "channel" => channel.to_string()).set(entries as f64);
    }
    histogram!("channel_compaction_duration_seconds", "channel" => channel.to_string())
        .record(duration.as_secs_f64());
}

/// Record a snapshot body written to the object store.
pub fn record_snapshot_written(channel: &str, bytes: usize) {
    counter!("channel_snapshots_written_total", "channel" => channel.to_string()).increment(1);
    histogram!("channel_snapshot_size_bytes", "channel" => channel.to_string()).record(bytes as f64);
}

// =============================================================================
// State Repository Metrics
// =============================================================================

/// Record a state repository mutation.
pub fn record_state_write(repository: &str, operation: &str) {
    counter!(
        "channel_state_writes_total",
        "repository" => repository.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_state_busy_retry(repository: &str, operation: &str) {
    counter!(
        "channel_state_busy_retries_total",
        "repository" => repository.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}
