// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lifecycle notifications for observability collaborators.
//!
//! The consumption engine emits a [`Notification`] on every state
//! transition. Hosts plug in their own [`NotificationSink`] (status pages,
//! event buses); the default [`LoggingSink`] writes tracing events.

use crate::engine::ConsumerState;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// A consumer state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub state: ConsumerState,
    /// Aggregate lag at the time of the transition, `None` if unknown.
    pub duration_behind: Option<Duration>,
    pub message: String,
}

/// Receives consumer lifecycle notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl NotificationSink for LoggingSink {
    fn notify(&self, n: &Notification) {
        let behind = n
            .duration_behind
            .map(|d| humantime::format_duration(d).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match n.state {
            ConsumerState::Failed => {
                error!(channel = %n.channel, state = %n.state, duration_behind = %behind, "{}", n.message)
            }
            ConsumerState::Stopped => {
                warn!(channel = %n.channel, state = %n.state, duration_behind = %behind, "{}", n.message)
            }
            _ => info!(channel = %n.channel, state = %n.state, duration_behind = %behind, "{}", n.message),
        }
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        match self.notifications.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// States in the order they were reported.
    pub fn states(&self) -> Vec<ConsumerState> {
        self.notifications().into_iter().map(|n| n.state).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        match self.notifications.lock() {
            Ok(mut guard) => guard.push(notification.clone()),
            Err(poisoned) => poisoned.into_inner().push(notification.clone()),
        }
    }
}
