// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumption engine.
//!
//! Drives one channel from a starting [`ChannelPosition`] until every shard
//! has met a [`StopCondition`], then returns the position reached.
//!
//! # Architecture
//!
//! ```text
//! consume_until(start, stop)
//!     │
//!     ├─ list_shards (retried)
//!     │
//!     ├─ JoinSet ─┬─ shard worker (shard-0) ─ poll → decode → intercept → dispatch
//!     │           ├─ shard worker (shard-1)
//!     │           └─ ...
//!     │
//!     └─ merge(start, per-shard positions) → ChannelPosition
//! ```
//!
//! One consumption per engine at a time. A failing shard raises the shared
//! stop signal so the others finish their current message (or polled queue
//! batch) and exit; the error is reported together with the position every
//! shard reached.

mod shard_loop;
mod types;

pub use types::{ConsumeError, ConsumerState, ShardExit};

use crate::config::ConsumerConfig;
use crate::consumer::MessageDispatcher;
use crate::error::{ChannelError, Result};
use crate::interceptor::InterceptorChain;
use crate::metrics;
use crate::notification::{LoggingSink, Notification, NotificationSink};
use crate::position::{ChannelDurationBehind, ChannelPosition};
use crate::stop::StopCondition;
use crate::transport::Transport;
use dashmap::DashMap;
use shard_loop::{ShardReport, ShardWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Consumes a single channel across all of its shards.
pub struct ConsumptionEngine {
    channel: String,
    transport: Arc<dyn Transport>,
    dispatcher: MessageDispatcher,
    interceptors: InterceptorChain,
    config: ConsumerConfig,
    sink: Arc<dyn NotificationSink>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<ConsumerState>,
    state_rx: watch::Receiver<ConsumerState>,

    /// Stop signal shared with shard workers
    stop_tx: watch::Sender<bool>,

    /// Latest known lag per shard of the current (or last) consumption
    lag: Arc<DashMap<String, Option<Duration>>>,
}

impl ConsumptionEngine {
    /// Create an idle engine with default config and a logging sink.
    pub fn new(
        channel: impl Into<String>,
        transport: Arc<dyn Transport>,
        dispatcher: MessageDispatcher,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Idle);
        let (stop_tx, _) = watch::channel(false);
        Self {
            channel: channel.into(),
            transport,
            dispatcher,
            interceptors: InterceptorChain::new(),
            config: ConsumerConfig::default(),
            sink: Arc::new(LoggingSink),
            state_tx,
            state_rx,
            stop_tx,
            lag: Arc::new(DashMap::new()),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Get current engine state.
    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConsumerState> {
        self.state_rx.clone()
    }

    /// Per-shard lag of the current consumption.
    ///
    /// Shards that have not reported yet are unknown.
    pub fn duration_behind(&self) -> ChannelDurationBehind {
        self.lag
            .iter()
            .fold(ChannelDurationBehind::new(), |acc, entry| {
                acc.with(entry.key().clone(), *entry.value())
            })
    }

    /// Ask every shard worker to finish its current message and exit.
    ///
    /// `consume_until` then returns the position reached. A stop requested
    /// before a consumption gets going is kept and ends it as soon as it
    /// starts; the request is cleared once a consumption finishes.
    pub fn stop(&self) {
        if self.state().is_active() {
            info!(channel = %self.channel, "Stop requested");
        }
        self.stop_tx.send_replace(true);
    }

    /// Consume from `start` until every shard meets `stop`.
    ///
    /// Shards missing from `start` begin at the horizon. The returned
    /// position holds the last dispatched message of every shard; shards
    /// that yielded nothing keep their starting entry.
    pub async fn consume_until(
        &self,
        start: ChannelPosition,
        stop: StopCondition,
    ) -> std::result::Result<ChannelPosition, ConsumeError> {
        let mut active = None;
        self.state_tx.send_if_modified(|state| {
            if state.is_active() {
                active = Some(*state);
                false
            } else {
                *state = ConsumerState::Starting;
                true
            }
        });
        if let Some(actual) = active {
            return Err(ConsumeError {
                channel: self.channel.clone(),
                position: start,
                source: ChannelError::InvalidState {
                    expected: "Idle, Finished, Failed or Stopped".to_string(),
                    actual: actual.to_string(),
                },
            });
        }

        self.lag.clear();
        metrics::set_consumer_state(&self.channel, ConsumerState::Starting);
        info!(channel = %self.channel, start = %start, stop = stop.label(), "Starting consumption");
        self.notify(ConsumerState::Starting, format!("Starting consumption from {}", start));

        let shards = match self.list_shards_with_retry().await {
            Ok(shards) => shards,
            Err(e) => return Err(self.fail(start, e)),
        };

        if *self.stop_tx.borrow() {
            self.finish(ConsumerState::Stopped, "Stopped before any shard started");
            return Ok(start);
        }

        for shard in &shards {
            self.lag.insert(shard.clone(), None);
        }
        self.transition(ConsumerState::Running);
        self.notify(
            ConsumerState::Running,
            format!("Consuming {} shard(s)", shards.len()),
        );

        let worker = Arc::new(ShardWorker {
            channel: self.channel.clone(),
            kind: self.transport.channel_kind(&self.channel),
            transport: Arc::clone(&self.transport),
            dispatcher: self.dispatcher.clone(),
            interceptors: self.interceptors.clone(),
            stop_condition: stop,
            config: self.config.clone(),
            lag: Arc::clone(&self.lag),
        });

        let mut tasks = JoinSet::new();
        for shard in &shards {
            tasks.spawn(shard_loop::run_shard(
                Arc::clone(&worker),
                start.lookup(shard),
                self.stop_tx.subscribe(),
            ));
        }

        let mut reached = ChannelPosition::new();
        let mut first_error: Option<ChannelError> = None;
        let mut cancelled = false;
        let mut dispatched = 0u64;

        while let Some(joined) = tasks.join_next().await {
            let report: ShardReport = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(channel = %self.channel, error = %e, "Shard task panicked");
                    self.stop_tx.send_replace(true);
                    first_error.get_or_insert(ChannelError::Internal(format!(
                        "shard task panicked: {}",
                        e
                    )));
                    continue;
                }
            };

            dispatched += report.dispatched;
            if !report.position.is_horizon() {
                reached.advance(report.position);
            }
            match report.exit {
                Ok(ShardExit::Cancelled) => cancelled = true,
                Ok(exit) => debug!(channel = %self.channel, shard = %report.shard, ?exit, "Shard done"),
                Err(e) => {
                    if first_error.is_none() {
                        warn!(
                            channel = %self.channel,
                            shard = %report.shard,
                            error = %e,
                            "Shard failed, stopping remaining shards"
                        );
                        self.stop_tx.send_replace(true);
                        first_error = Some(e);
                    }
                }
            }
        }

        let position = start.merge(&reached);

        if let Some(e) = first_error {
            return Err(self.fail(position, e));
        }

        let (state, summary) = if cancelled {
            (ConsumerState::Stopped, "Consumption stopped")
        } else {
            (ConsumerState::Finished, "Consumption finished")
        };
        info!(channel = %self.channel, position = %position, dispatched, "{}", summary);
        self.finish(state, &format!("{} at {}", summary, position));
        Ok(position)
    }

    async fn list_shards_with_retry(&self) -> Result<Vec<String>> {
        let retry = self.config.error_retry_config();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            match self.transport.list_shards(&self.channel).await {
                Ok(shards) => return Ok(shards),
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        channel = %self.channel,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Listing shards failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn transition(&self, state: ConsumerState) {
        self.state_tx.send_replace(state);
        metrics::set_consumer_state(&self.channel, state);
    }

    fn finish(&self, state: ConsumerState, message: &str) {
        self.stop_tx.send_replace(false);
        self.transition(state);
        self.notify(state, message.to_string());
    }

    fn fail(&self, position: ChannelPosition, source: ChannelError) -> ConsumeError {
        error!(channel = %self.channel, position = %position, error = %source, "Consumption failed");
        self.finish(ConsumerState::Failed, &source.to_string());
        ConsumeError {
            channel: self.channel.clone(),
            position,
            source,
        }
    }

    fn notify(&self, state: ConsumerState, message: String) {
        self.sink.notify(&Notification {
            channel: self.channel.clone(),
            state,
            duration_behind: self.duration_behind().duration_behind(),
            message,
        });
    }
}

impl std::fmt::Debug for ConsumptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumptionEngine")
            .field("channel", &self.channel)
            .field("state", &self.state())
            .field("consumers", &self.dispatcher.len())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
