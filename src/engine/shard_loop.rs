// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-shard poll/dispatch loop.
//!
//! Each shard of a channel gets a dedicated worker that:
//! 1. Polls the shard from its checkpoint
//! 2. Decodes each record and stamps it with a header
//! 3. Runs the interceptor chain and dispatches to consumers
//! 4. Advances the shard position after each dispatched message
//! 5. Evaluates the stop condition per message and per empty poll, against
//!    the shard's lag behind its head once the batch is consumed
//!
//! # Error Handling
//!
//! Transport errors are retried with exponential backoff; after
//! `max_consecutive_errors` in a row the worker fails. Decode errors and
//! state repository errors fail the worker immediately. In every case the
//! returned position covers exactly the messages that were dispatched.
//!
//! # Cancellation
//!
//! The stop signal is checked between batches and during sleeps (via
//! `tokio::select!`). Log shards also check it between messages and abandon
//! an in-flight poll. Queue shards remove records from the backend when they
//! poll them, so a queue poll always completes and its batch is always
//! dispatched in full before the worker exits.

use super::types::ShardExit;
use crate::config::ConsumerConfig;
use crate::consumer::MessageDispatcher;
use crate::error::{ChannelError, Result};
use crate::interceptor::InterceptorChain;
use crate::message::{decode_record, Header};
use crate::metrics;
use crate::position::ShardPosition;
use crate::stop::{ShardProgress, StopCondition};
use crate::transport::{ChannelKind, Transport};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Everything the shard workers of one consumption share.
pub(crate) struct ShardWorker {
    pub channel: String,
    pub kind: ChannelKind,
    pub transport: Arc<dyn Transport>,
    pub dispatcher: MessageDispatcher,
    pub interceptors: InterceptorChain,
    pub stop_condition: StopCondition,
    pub config: ConsumerConfig,
    /// Latest known lag per shard.
    pub lag: Arc<DashMap<String, Option<Duration>>>,
}

impl ShardWorker {
    fn record_lag(&self, shard: &str, behind: Option<Duration>) {
        self.lag.insert(shard.to_string(), behind);
        metrics::set_shard_duration_behind(&self.channel, shard, behind);
    }
}

/// Final state of one shard worker.
pub(crate) struct ShardReport {
    pub shard: String,
    pub position: ShardPosition,
    pub exit: Result<ShardExit>,
    pub dispatched: u64,
}

/// Run one shard until its stop condition holds, it drains, it fails, or
/// the stop signal is raised.
pub(crate) async fn run_shard(
    worker: Arc<ShardWorker>,
    start: ShardPosition,
    mut stop_rx: watch::Receiver<bool>,
) -> ShardReport {
    let shard = start.shard().to_string();
    let span = info_span!("shard", channel = %worker.channel, shard = %shard);

    async move {
        debug!(from = %start, "Starting shard worker");
        let mut position = start;
        let mut dispatched = 0u64;

        let exit = consume_shard(&worker, &mut position, &mut dispatched, &mut stop_rx).await;

        match &exit {
            Ok(reason) => info!(?reason, position = %position, dispatched, "Shard worker finished"),
            Err(e) => error!(error = %e, position = %position, dispatched, "Shard worker failed"),
        }

        ShardReport {
            shard,
            position,
            exit,
            dispatched,
        }
    }
    .instrument(span)
    .await
}

async fn consume_shard(
    worker: &ShardWorker,
    position: &mut ShardPosition,
    dispatched: &mut u64,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<ShardExit> {
    let channel = worker.channel.as_str();
    let shard = position.shard().to_string();
    let retry = worker.config.error_retry_config();
    let poll_interval = worker.config.poll_interval_duration();
    let batch_size = worker.config.poll_batch_size;
    let mut consecutive_errors = 0usize;

    loop {
        if *stop_rx.borrow() {
            return Ok(ShardExit::Cancelled);
        }

        let poll_start = Instant::now();
        let polled = if worker.kind == ChannelKind::Queue {
            worker.transport.poll(channel, position, batch_size).await
        } else {
            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return Ok(ShardExit::Cancelled);
                    }
                    continue;
                }
                result = worker.transport.poll(channel, position, batch_size) => result,
            }
        };

        let response = match polled {
            Ok(response) => {
                if consecutive_errors > 0 {
                    info!(consecutive_errors, "Poll recovered");
                }
                consecutive_errors = 0;
                response
            }
            Err(e) if e.is_retryable() => {
                consecutive_errors += 1;
                metrics::record_poll_error(channel, &shard);
                if consecutive_errors >= retry.max_attempts {
                    error!(
                        error = %e,
                        consecutive_errors,
                        "Poll failed too many times in a row, giving up"
                    );
                    return Err(e);
                }
                let backoff = retry.delay_for_attempt(consecutive_errors);
                warn!(
                    error = %e,
                    consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    "Poll failed, backing off"
                );
                if wait_or_stop(stop_rx, backoff).await {
                    return Ok(ShardExit::Cancelled);
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        metrics::record_poll(channel, &shard, response.records.len(), poll_start.elapsed());
        let behind_latest = response.behind_latest;

        if response.is_empty() {
            worker.record_lag(&shard, behind_latest);
            if worker.kind == ChannelKind::Queue {
                return Ok(ShardExit::Drained);
            }
            let progress = ShardProgress {
                shard: &shard,
                duration_behind: behind_latest,
                message: None,
            };
            if worker.stop_condition.should_stop(&progress) {
                return Ok(ShardExit::StopConditionMet);
            }
            if wait_or_stop(stop_rx, poll_interval).await {
                return Ok(ShardExit::Cancelled);
            }
            continue;
        }

        // A full batch may have left records the backend's lag does not
        // account for, so the shard's lag stays unknown until a poll comes
        // back short.
        let shard_lag = if response.records.len() < batch_size {
            behind_latest
        } else {
            None
        };

        let mut stop_after_batch = false;
        let mut batch_dispatched = 0usize;
        for record in response.records {
            if worker.kind == ChannelKind::Log && *stop_rx.borrow() {
                return Ok(ShardExit::Cancelled);
            }

            let message = decode_record(channel, &shard, &record.data).map_err(|e| {
                metrics::record_decode_error(channel, &shard);
                e
            })?;
            let record_position = ShardPosition::at(shard.as_str(), record.sequence_token);
            let message = message.with_header(Header::of(
                record_position.clone(),
                record.arrival_timestamp,
            ));
            let stop_here = worker.stop_condition.should_stop(&ShardProgress {
                shard: &shard,
                duration_behind: shard_lag,
                message: Some(&message),
            });

            match worker.interceptors.apply(message) {
                Some(message) => {
                    worker.dispatcher.dispatch(channel, &message).await?;
                    *dispatched += 1;
                    batch_dispatched += 1;
                }
                None => {
                    debug!(token = record_position.token(), "Message dropped by interceptor");
                }
            }

            *position = record_position;
            stop_after_batch |= stop_here;
        }
        metrics::record_messages_consumed(channel, &shard, batch_dispatched);
        worker.record_lag(&shard, shard_lag);

        if stop_after_batch {
            return Ok(ShardExit::StopConditionMet);
        }
    }
}

/// Sleep for `delay` unless the stop signal is raised first.
///
/// Returns `true` if the worker should stop.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;

        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

impl std::fmt::Debug for ShardReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReport")
            .field("shard", &self.shard)
            .field("position", &self.position)
            .field("exit", &self.exit.as_ref().map_err(ChannelError::kind))
            .field("dispatched", &self.dispatched)
            .finish()
    }
}
