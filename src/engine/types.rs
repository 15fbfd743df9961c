// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer state types.
//!
//! # State Transitions
//!
//! ```text
//!              consume_until()
//! Idle ─────────────────────────→ Starting
//!                                    │
//!                                    │ (shards listed)
//!                                    ↓
//!                                 Running ──── stop() ────→ Stopped
//!                                    │
//!                  ┌─────────────────┴─────────────────┐
//!                  │ (every shard stopped)             │ (shard error)
//!                  ↓                                   ↓
//!              Finished                             Failed
//! ```
//!
//! `stop()` is accepted from `Starting` as well. Terminal states may start a
//! new consumption; active states reject it.

use crate::error::ChannelError;
use crate::position::ChannelPosition;
use thiserror::Error;

/// State of a consumption engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not consuming.
    Idle,

    /// Listing shards.
    Starting,

    /// Shard workers are polling.
    Running,

    /// Every shard met its stop condition (or a queue drained).
    Finished,

    /// A shard hit an unrecoverable error.
    Failed,

    /// Cancelled through `stop()`.
    Stopped,
}

impl ConsumerState {
    /// Whether a consumption is in progress.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerState::Idle => write!(f, "Idle"),
            ConsumerState::Starting => write!(f, "Starting"),
            ConsumerState::Running => write!(f, "Running"),
            ConsumerState::Finished => write!(f, "Finished"),
            ConsumerState::Failed => write!(f, "Failed"),
            ConsumerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// How a single shard worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardExit {
    /// The stop condition returned true.
    StopConditionMet,
    /// A queue shard had nothing left to hand out.
    Drained,
    /// The stop signal was raised.
    Cancelled,
}

/// A failed consumption, with the position reached before the failure.
///
/// `position` covers every message that was fully dispatched, so resuming
/// from it neither skips nor repeats messages of healthy shards.
#[derive(Debug, Error)]
#[error("Consumption of channel '{channel}' failed at {position}: {source}")]
pub struct ConsumeError {
    pub channel: String,
    pub position: ChannelPosition,
    #[source]
    pub source: ChannelError,
}

impl ConsumeError {
    pub fn into_parts(self) -> (ChannelPosition, ChannelError) {
        (self.position, self.source)
    }
}
