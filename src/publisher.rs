// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reliable batch publishing.
//!
//! A publish call splits its messages into sub-batches no larger than the
//! transport accepts, then submits each sub-batch until every record is
//! acknowledged:
//!
//! ```text
//! messages ─ interceptors ─ encode ─ chunk(max_batch_size)
//!                                          │
//!                     ┌────────────────────┘
//!                     ↓
//!              put_batch(pending) ──→ all accepted ──→ next sub-batch
//!                     │
//!                     ├─ terminal outcome  ──→ TerminalPublish (no retry)
//!                     └─ retryable outcomes ──→ backoff, pending = failed only
//!                                               (PublishExhausted after max_attempts)
//! ```
//!
//! Resubmissions carry the original key and payload of each failed record.
//! Records that were accepted are never sent twice by the publisher itself.

use crate::config::PublisherConfig;
use crate::error::{ChannelError, Result};
use crate::interceptor::InterceptorChain;
use crate::message::{encode_record, Message};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::transport::{FailureKind, OutgoingRecord, RecordOutcome, Transport};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Summary of a successful publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Records acknowledged by the transport.
    pub records: usize,
    /// Sub-batches submitted.
    pub sub_batches: usize,
    /// `put_batch` calls made, including resubmissions.
    pub attempts: usize,
}

/// Publishes messages with per-record partial-failure retry.
pub struct ReliableBatchPublisher {
    transport: Arc<dyn Transport>,
    interceptors: InterceptorChain,
    config: PublisherConfig,
}

impl ReliableBatchPublisher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptors: InterceptorChain::new(),
            config: PublisherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Records per sub-batch: the smaller of our limit and the transport's.
    pub fn sub_batch_size(&self) -> usize {
        self.config
            .max_batch_size
            .min(self.transport.max_batch_size())
            .max(1)
    }

    /// Publish `messages` to `channel`.
    ///
    /// Succeeds only when every record was acknowledged. A terminal rejection
    /// or exhausted retries fail the whole call; sub-batches acknowledged
    /// before the failure stay published.
    #[instrument(skip_all, fields(channel = %channel, messages = messages.len()))]
    pub async fn publish(&self, channel: &str, messages: Vec<Message>) -> Result<PublishReport> {
        let start = Instant::now();

        let records = messages
            .into_iter()
            .filter_map(|message| self.interceptors.apply(message))
            .map(|message| {
                Ok(OutgoingRecord {
                    key: message.key().to_string(),
                    data: encode_record(&message, self.config.compress)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if records.is_empty() {
            debug!("Nothing to publish");
            return Ok(PublishReport::default());
        }

        let retry = self.config.retry_config();
        let mut report = PublishReport::default();

        for (index, chunk) in records.chunks(self.sub_batch_size()).enumerate() {
            let attempts = self
                .publish_sub_batch(channel, index, chunk.to_vec(), &retry)
                .await
                .map_err(|e| {
                    metrics::record_publish_failure(channel, e.kind());
                    e
                })?;
            report.records += chunk.len();
            report.sub_batches += 1;
            report.attempts += attempts;
        }

        metrics::record_publish(channel, report.records, report.sub_batches, start.elapsed());
        info!(
            records = report.records,
            sub_batches = report.sub_batches,
            attempts = report.attempts,
            duration_ms = start.elapsed().as_millis() as u64,
            "Published batch"
        );
        Ok(report)
    }

    /// Submit one sub-batch until it is fully acknowledged.
    ///
    /// Returns the number of `put_batch` calls it took.
    async fn publish_sub_batch(
        &self,
        channel: &str,
        index: usize,
        records: Vec<OutgoingRecord>,
        retry: &RetryConfig,
    ) -> Result<usize> {
        let mut pending = records;
        let mut attempt = 0usize;

        loop {
            attempt += 1;

            let failed = match self.transport.put_batch(channel, pending.clone()).await {
                Ok(outcomes) => collect_failures(channel, pending, outcomes)?,
                Err(e) if e.is_retryable() => {
                    warn!(sub_batch = index, attempt, error = %e, "put_batch failed");
                    pending
                }
                Err(e) => return Err(e),
            };

            if failed.is_empty() {
                debug!(sub_batch = index, attempt, "Sub-batch acknowledged");
                return Ok(attempt);
            }

            if attempt >= retry.max_attempts {
                return Err(ChannelError::PublishExhausted {
                    channel: channel.to_string(),
                    sub_batch: index,
                    remaining: failed.len(),
                    attempts: attempt,
                });
            }

            let delay = retry.delay_for_attempt(attempt);
            warn!(
                sub_batch = index,
                attempt,
                failed = failed.len(),
                delay_ms = delay.as_millis() as u64,
                "Retrying failed records"
            );
            metrics::record_publish_retry(channel, failed.len());
            tokio::time::sleep(delay).await;
            pending = failed;
        }
    }
}

/// Pair each record with its outcome and keep the retryable failures.
///
/// The first terminal outcome aborts.
fn collect_failures(
    channel: &str,
    pending: Vec<OutgoingRecord>,
    outcomes: Vec<RecordOutcome>,
) -> Result<Vec<OutgoingRecord>> {
    if outcomes.len() != pending.len() {
        return Err(ChannelError::Internal(format!(
            "transport returned {} outcomes for {} records",
            outcomes.len(),
            pending.len()
        )));
    }

    let mut failed = Vec::new();
    for (record, outcome) in pending.into_iter().zip(outcomes) {
        match outcome {
            RecordOutcome::Accepted { .. } => {}
            RecordOutcome::Failed {
                kind: FailureKind::Terminal,
                code,
                message,
            } => {
                return Err(ChannelError::TerminalPublish {
                    channel: channel.to_string(),
                    key: record.key,
                    code,
                    message,
                });
            }
            RecordOutcome::Failed {
                kind: FailureKind::Retryable,
                code,
                ..
            } => {
                debug!(key = %record.key, code = %code, "Record rejected, will retry");
                failed.push(record);
            }
        }
    }
    Ok(failed)
}

impl std::fmt::Debug for ReliableBatchPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableBatchPublisher")
            .field("sub_batch_size", &self.sub_batch_size())
            .field("config", &self.config)
            .finish()
    }
}
