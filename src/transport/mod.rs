// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport capability contract.
//!
//! Every backing system (log-like streams, queue-like services) is reached
//! through the [`Transport`] trait. The consumption engine and the batch
//! publisher depend only on this trait, never on a concrete backend.
//!
//! # Channel Kinds
//!
//! | Kind | Retention | Poll semantics | Consumption ends |
//! |------|-----------|----------------|------------------|
//! | `Log` | Records retained | Read after a sequence token | Only by stop condition or shutdown |
//! | `Queue` | Records removed on poll | Next pending records | After a drain with nothing pending |
//!
//! # Example
//!
//! ```rust,no_run
//! use channel_engine::transport::{Transport, ChannelKind, PollResponse, OutgoingRecord, RecordOutcome};
//! use channel_engine::position::ShardPosition;
//! use channel_engine::BoxFuture;
//!
//! struct NullTransport;
//!
//! impl Transport for NullTransport {
//!     fn channel_kind(&self, _channel: &str) -> ChannelKind {
//!         ChannelKind::Queue
//!     }
//!
//!     fn list_shards<'a>(&'a self, _channel: &'a str) -> BoxFuture<'a, Vec<String>> {
//!         Box::pin(async move { Ok(vec!["queue".to_string()]) })
//!     }
//!
//!     fn poll<'a>(
//!         &'a self,
//!         _channel: &'a str,
//!         _from: &'a ShardPosition,
//!         _max_records: usize,
//!     ) -> BoxFuture<'a, PollResponse> {
//!         Box::pin(async move { Ok(PollResponse::caught_up(vec![])) })
//!     }
//!
//!     fn put_batch<'a>(
//!         &'a self,
//!         _channel: &'a str,
//!         records: Vec<OutgoingRecord>,
//!     ) -> BoxFuture<'a, Vec<RecordOutcome>> {
//!         Box::pin(async move { Ok(records.iter().map(|_| RecordOutcome::accepted(None)).collect()) })
//!     }
//! }
//! ```

pub mod memory;

pub use memory::InMemoryTransport;

use crate::position::ShardPosition;
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default maximum records per `put_batch` call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Retention model of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Ordered, retained, replayable stream.
    Log,
    /// Records are handed out once and removed.
    Queue,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log => write!(f, "log"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

/// A raw record as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRecord {
    /// Opaque backend token of this record.
    pub sequence_token: String,
    /// When the backend accepted the record.
    pub arrival_timestamp: DateTime<Utc>,
    /// Encoded envelope.
    pub data: Vec<u8>,
}

/// Result of polling one shard.
#[derive(Debug, Clone, Default)]
pub struct PollResponse {
    pub records: Vec<TransportRecord>,
    /// How far the shard's head is ahead of this response, if the backend
    /// reports it. `Some(ZERO)` means the shard is caught up.
    pub behind_latest: Option<Duration>,
}

impl PollResponse {
    /// Response for a shard with nothing left to read.
    pub fn caught_up(records: Vec<TransportRecord>) -> Self {
        Self {
            records,
            behind_latest: Some(Duration::ZERO),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A record handed to `put_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    /// Partition key, used by the backend to pick a shard.
    pub key: String,
    pub data: Vec<u8>,
}

/// Classification of a rejected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient, e.g. throughput exceeded. Resubmitting may succeed.
    Retryable,
    /// Permanent, e.g. validation rejected. Resubmitting cannot succeed.
    Terminal,
}

/// Per-record outcome of a `put_batch` call, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted {
        sequence_token: Option<String>,
    },
    Failed {
        kind: FailureKind,
        code: String,
        message: String,
    },
}

impl RecordOutcome {
    pub fn accepted(sequence_token: Option<String>) -> Self {
        Self::Accepted { sequence_token }
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: FailureKind::Retryable,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn terminal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: FailureKind::Terminal,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Capability contract every backend transport implements.
///
/// Implementations report transport problems as
/// [`ChannelError::Transport`](crate::error::ChannelError::Transport), which
/// callers retry with backoff.
pub trait Transport: Send + Sync + 'static {
    /// Retention model of `channel`.
    fn channel_kind(&self, channel: &str) -> ChannelKind;

    /// Largest batch accepted by one `put_batch` call.
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }

    /// Shard ids of `channel`.
    fn list_shards<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Vec<String>>;

    /// Read up to `max_records` records of one shard after `from`.
    ///
    /// Queue transports ignore the token and return the next pending records.
    fn poll<'a>(
        &'a self,
        channel: &'a str,
        from: &'a ShardPosition,
        max_records: usize,
    ) -> BoxFuture<'a, PollResponse>;

    /// Submit records. The result has one outcome per record, in order.
    fn put_batch<'a>(
        &'a self,
        channel: &'a str,
        records: Vec<OutgoingRecord>,
    ) -> BoxFuture<'a, Vec<RecordOutcome>>;
}
