// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the channel engine.
//!
//! Errors are categorized by the component that raised them and carry
//! enough context (channel, shard, operation) to be actionable from a log
//! line alone.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Network errors, throttling on poll or publish |
//! | `TerminalPublish` | No | Backend rejected a record (validation) |
//! | `PublishExhausted` | No | Retries used up with residual failures |
//! | `Consumption` | No | A record could not be decoded |
//! | `CompactionAborted` | No | Replay or snapshot serialization failed |
//! | `CompactionInProgress` | No | Another compaction holds the channel |
//! | `StateRepository` | No | Backing store unavailable |
//! | `SqliteStore` | No | Local SQLite errors (needs operator attention) |
//! | `Snapshot` | No | Snapshot artifact malformed or checksum mismatch |
//! | `ObjectStore` | No | Snapshot object could not be read or written |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Consumption state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ChannelError::is_retryable()`] to determine if an operation
//! should be retried with backoff. Only transport failures are transient;
//! everything else is either a contract violation by the backend, corrupt
//! data, or a local fault that retrying cannot fix.

use thiserror::Error;

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur while consuming, compacting or publishing channels.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Transport failure on poll, shard listing or publish.
    ///
    /// Retried internally up to a bounded ceiling.
    #[error("Transport error on channel '{channel}' ({operation}): {message}")]
    Transport {
        channel: String,
        operation: String,
        message: String,
    },

    /// The backend rejected a record outright (e.g. validation).
    ///
    /// The publish call is aborted without retrying.
    #[error("Terminal publish error on channel '{channel}' for key '{key}': {code}: {message}")]
    TerminalPublish {
        channel: String,
        key: String,
        code: String,
        message: String,
    },

    /// Retries were exhausted with records still failing.
    #[error("Publish to channel '{channel}' failed: sub-batch {sub_batch} still had {remaining} failed records after {attempts} attempts")]
    PublishExhausted {
        channel: String,
        sub_batch: usize,
        remaining: usize,
        attempts: usize,
    },

    /// A record could not be decoded into a message.
    ///
    /// Undecodable data is never skipped silently: the shard stops.
    #[error("Consumption error on channel '{channel}' shard '{shard}': {message}")]
    Consumption {
        channel: String,
        shard: String,
        message: String,
    },

    /// Compaction aborted before a snapshot was published.
    #[error("Compaction of channel '{channel}' aborted: {message}")]
    CompactionAborted { channel: String, message: String },

    /// Another compaction of the same channel is running in this process.
    #[error("Compaction of channel '{0}' is already in progress")]
    CompactionInProgress(String),

    /// The state repository could not serve the request.
    #[error("State repository '{repository}' error: {message}")]
    StateRepository { repository: String, message: String },

    /// SQLite error in the persistent state repository.
    #[error("SQLite store error: {0}")]
    SqliteStore(#[from] sqlx::Error),

    /// Snapshot artifact could not be encoded, decoded or verified.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Object store failure while reading or writing snapshots.
    #[error("Object store error ({operation} '{key}'): {message}")]
    ObjectStore {
        operation: String,
        key: String,
        message: String,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Consumption state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChannelError {
    /// Create a transport error.
    pub fn transport(
        channel: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transport {
            channel: channel.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a decode error for a shard.
    pub fn consumption(
        channel: impl Into<String>,
        shard: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Consumption {
            channel: channel.into(),
            shard: shard.into(),
            message: message.into(),
        }
    }

    /// Create a state repository error.
    pub fn state_repository(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateRepository {
            repository: repository.into(),
            message: message.into(),
        }
    }

    /// Create an object store error.
    pub fn object_store(
        operation: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ObjectStore {
            operation: operation.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::TerminalPublish { .. } => false,
            Self::PublishExhausted { .. } => false,
            Self::Consumption { .. } => false, // Corrupt data at the source
            Self::CompactionAborted { .. } => false,
            Self::CompactionInProgress(_) => false,
            Self::StateRepository { .. } => false,
            Self::SqliteStore(_) => false, // Local DB issues need attention
            Self::Snapshot(_) => false,
            Self::ObjectStore { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::TerminalPublish { .. } => "terminal_publish",
            Self::PublishExhausted { .. } => "publish_exhausted",
            Self::Consumption { .. } => "consumption",
            Self::CompactionAborted { .. } => "compaction_aborted",
            Self::CompactionInProgress(_) => "compaction_in_progress",
            Self::StateRepository { .. } | Self::SqliteStore(_) => "state_repository",
            Self::Snapshot(_) => "snapshot",
            Self::ObjectStore { .. } => "object_store",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this error originates from a state repository.
    ///
    /// Repository failures must halt the shard that hit them; every other
    /// consumer failure is logged and skipped.
    pub fn is_state_repository(&self) -> bool {
        matches!(self, Self::StateRepository { .. } | Self::SqliteStore(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_transport() {
        let err = ChannelError::transport("orders", "poll", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("orders"));
        assert!(err.to_string().contains("poll"));
    }

    #[test]
    fn test_not_retryable_terminal_publish() {
        let err = ChannelError::TerminalPublish {
            channel: "orders".to_string(),
            key: "k1".to_string(),
            code: "ValidationException".to_string(),
            message: "record too large".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ValidationException"));
    }

    #[test]
    fn test_publish_exhausted_names_sub_batch() {
        let err = ChannelError::PublishExhausted {
            channel: "orders".to_string(),
            sub_batch: 2,
            remaining: 7,
            attempts: 3,
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("sub-batch 2"));
        assert!(msg.contains("7 failed records"));
    }

    #[test]
    fn test_not_retryable_consumption() {
        let err = ChannelError::consumption("orders", "shard-0", "invalid JSON");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("shard-0"));
    }

    #[test]
    fn test_state_repository_classification() {
        let err = ChannelError::state_repository("products", "backing store unavailable");
        assert!(err.is_state_repository());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "state_repository");

        let err = ChannelError::SqliteStore(sqlx::Error::PoolTimedOut);
        assert!(err.is_state_repository());

        let err = ChannelError::transport("c", "poll", "x");
        assert!(!err.is_state_repository());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ChannelError::InvalidState {
            expected: "Idle".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Idle"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_retryable_misc() {
        assert!(!ChannelError::Internal("x".into()).is_retryable());
        assert!(!ChannelError::Config("x".into()).is_retryable());
        assert!(!ChannelError::Snapshot("x".into()).is_retryable());
        assert!(!ChannelError::CompactionInProgress("c".into()).is_retryable());
    }

    #[test]
    fn test_object_store_error_formatting() {
        let err = ChannelError::object_store("put", "snapshots/orders/latest", "disk full");
        let msg = err.to_string();
        assert!(msg.contains("put"));
        assert!(msg.contains("snapshots/orders/latest"));
        assert!(msg.contains("disk full"));
    }
}
