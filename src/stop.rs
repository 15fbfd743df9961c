// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stop conditions for channel consumption.
//!
//! A [`StopCondition`] is evaluated per shard, once for every dispatched
//! message and once for every empty poll. It returns `true` when the shard
//! should stop; the shard then finishes its current batch and exits.
//!
//! ```rust
//! use channel_engine::stop::StopCondition;
//! use std::time::Duration;
//!
//! // Stop once caught up, or after running into new traffic.
//! let stop = StopCondition::lag_within(Duration::from_secs(10))
//!     .or(StopCondition::arrival_after_now());
//! ```

use crate::message::Message;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What the engine knows about a shard when it evaluates a stop condition.
#[derive(Debug, Clone, Copy)]
pub struct ShardProgress<'a> {
    pub shard: &'a str,
    /// How far the shard's head is ahead of the batch being consumed, as
    /// reported by the backend. `None` if unknown, including after a full
    /// batch that may have left records unread.
    pub duration_behind: Option<Duration>,
    /// The message just dispatched, `None` for an empty poll.
    pub message: Option<&'a Message>,
}

type Predicate = dyn Fn(&ShardProgress<'_>) -> bool + Send + Sync;

/// Composable, cloneable per-shard stop predicate.
#[derive(Clone)]
pub struct StopCondition {
    predicate: Arc<Predicate>,
    label: Arc<str>,
}

impl StopCondition {
    /// Custom predicate.
    pub fn new<F>(label: &str, predicate: F) -> Self
    where
        F: Fn(&ShardProgress<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            label: Arc::from(label),
        }
    }

    /// Never stop. Log channels then run until shutdown.
    pub fn never() -> Self {
        Self::new("never", |_| false)
    }

    /// Stop once the shard is known to be fully caught up.
    pub fn end_of_channel() -> Self {
        Self::new("end_of_channel", |p| p.duration_behind == Some(Duration::ZERO))
    }

    /// Stop once the shard's known lag is at most `threshold`.
    ///
    /// Unknown lag never stops.
    pub fn lag_within(threshold: Duration) -> Self {
        let label = format!("lag_within({})", humantime::format_duration(threshold));
        Self::new(&label, move |p| p.duration_behind.is_some_and(|d| d <= threshold))
    }

    /// Stop once wall clock has passed `deadline`.
    pub fn after(deadline: DateTime<Utc>) -> Self {
        let label = format!("after({})", deadline.to_rfc3339());
        Self::new(&label, move |_| Utc::now() >= deadline)
    }

    /// Stop on the first message that arrived after this condition was built.
    pub fn arrival_after_now() -> Self {
        let created = Utc::now();
        Self::new("arrival_after_now", move |p| {
            p.message
                .and_then(Message::arrival_timestamp)
                .is_some_and(|arrival| arrival > created)
        })
    }

    /// Stop when both conditions hold.
    pub fn and(self, other: StopCondition) -> Self {
        let label = format!("({} and {})", self.label, other.label);
        Self::new(&label, move |p| self.should_stop(p) && other.should_stop(p))
    }

    /// Stop when either condition holds.
    pub fn or(self, other: StopCondition) -> Self {
        let label = format!("({} or {})", self.label, other.label);
        Self::new(&label, move |p| self.should_stop(p) || other.should_stop(p))
    }

    pub fn should_stop(&self, progress: &ShardProgress<'_>) -> bool {
        (self.predicate)(progress)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StopCondition").field(&&*self.label).finish()
    }
}
