// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process transport for log and queue channels.
//!
//! Log shards retain every record and use the record index as sequence
//! token. Queue channels have a single shard and hand each record out once.
//! Used for local development, single-process deployments and tests.

use super::{
    ChannelKind, OutgoingRecord, PollResponse, RecordOutcome, Transport, TransportRecord,
    DEFAULT_MAX_BATCH_SIZE,
};
use crate::error::{ChannelError, Result};
use crate::message::{encode_record, Message};
use crate::position::ShardPosition;
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Records larger than this are rejected with a terminal outcome.
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Shard id of every queue channel.
pub const QUEUE_SHARD: &str = "queue";

enum ShardLog {
    Log(Vec<TransportRecord>),
    Queue {
        pending: VecDeque<TransportRecord>,
        next_token: u64,
    },
}

struct MemoryChannel {
    shard_ids: Vec<String>,
    shards: HashMap<String, ShardLog>,
}

impl MemoryChannel {
    fn new(kind: ChannelKind, shard_count: usize) -> Self {
        let shard_ids: Vec<String> = match kind {
            ChannelKind::Log => (0..shard_count.max(1)).map(|i| format!("shard-{}", i)).collect(),
            ChannelKind::Queue => vec![QUEUE_SHARD.to_string()],
        };
        let shards = shard_ids
            .iter()
            .map(|id| {
                let log = match kind {
                    ChannelKind::Log => ShardLog::Log(Vec::new()),
                    ChannelKind::Queue => ShardLog::Queue {
                        pending: VecDeque::new(),
                        next_token: 0,
                    },
                };
                (id.clone(), log)
            })
            .collect();
        Self {
            shard_ids,
            shards,
        }
    }

    fn shard_for_key(&self, key: &str) -> &str {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shard_ids.len() as u64) as usize;
        &self.shard_ids[index]
    }

    fn append(&mut self, key: &str, data: Vec<u8>, arrival: DateTime<Utc>) -> Option<String> {
        let shard = self.shard_for_key(key).to_string();
        let log = self.shards.get_mut(&shard)?;
        let token = match log {
            ShardLog::Log(records) => {
                let token = records.len().to_string();
                records.push(TransportRecord {
                    sequence_token: token.clone(),
                    arrival_timestamp: arrival,
                    data,
                });
                token
            }
            ShardLog::Queue {
                pending,
                next_token,
            } => {
                let token = next_token.to_string();
                *next_token += 1;
                pending.push_back(TransportRecord {
                    sequence_token: token.clone(),
                    arrival_timestamp: arrival,
                    data,
                });
                token
            }
        };
        Some(token)
    }
}

/// Lag of the first unread record, zero when nothing is left.
fn behind_latest(next_unread: Option<&TransportRecord>) -> Option<Duration> {
    match next_unread {
        Some(record) => Some(
            (Utc::now() - record.arrival_timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO),
        ),
        None => Some(Duration::ZERO),
    }
}

/// In-memory [`Transport`].
pub struct InMemoryTransport {
    channels: RwLock<HashMap<String, MemoryChannel>>,
    kinds: DashMap<String, ChannelKind>,
    max_batch_size: usize,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_max_batch_size(DEFAULT_MAX_BATCH_SIZE)
    }

    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            kinds: DashMap::new(),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Create a log channel with `shard_count` shards named `shard-{i}`.
    ///
    /// Existing channels are left untouched.
    pub async fn create_log(&self, channel: &str, shard_count: usize) {
        self.kinds.entry(channel.to_string()).or_insert(ChannelKind::Log);
        self.channels
            .write()
            .await
            .entry(channel.to_string())
            .or_insert_with(|| MemoryChannel::new(ChannelKind::Log, shard_count));
    }

    /// Create a single-shard queue channel.
    pub async fn create_queue(&self, channel: &str) {
        self.kinds.entry(channel.to_string()).or_insert(ChannelKind::Queue);
        self.channels
            .write()
            .await
            .entry(channel.to_string())
            .or_insert_with(|| MemoryChannel::new(ChannelKind::Queue, 1));
    }

    /// Append an encoded message with an explicit arrival timestamp.
    ///
    /// Returns the shard and token the message was stored under.
    pub async fn append_at(
        &self,
        channel: &str,
        message: &Message,
        arrival: DateTime<Utc>,
    ) -> Result<ShardPosition> {
        let data = encode_record(message, false)?;
        self.append_raw(channel, message.key(), data, arrival).await
    }

    /// Append an already-encoded record under `key`.
    pub async fn append_raw(
        &self,
        channel: &str,
        key: &str,
        data: Vec<u8>,
        arrival: DateTime<Utc>,
    ) -> Result<ShardPosition> {
        let mut channels = self.channels.write().await;
        let ch = channels
            .get_mut(channel)
            .ok_or_else(|| unknown_channel(channel, "append"))?;
        let shard = ch.shard_for_key(key).to_string();
        let token = ch
            .append(key, data, arrival)
            .ok_or_else(|| unknown_channel(channel, "append"))?;
        Ok(ShardPosition::at(shard, token))
    }

    /// Append an encoded message arriving now.
    pub async fn append(&self, channel: &str, message: &Message) -> Result<ShardPosition> {
        self.append_at(channel, message, Utc::now()).await
    }

    /// Number of records stored (log) or pending (queue) across all shards.
    pub async fn record_count(&self, channel: &str) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(channel)
            .map(|ch| {
                ch.shards
                    .values()
                    .map(|log| match log {
                        ShardLog::Log(records) => records.len(),
                        ShardLog::Queue { pending, .. } => pending.len(),
                    })
                    .sum()
            })
            .unwrap_or(0)
    }
}

fn unknown_channel(channel: &str, operation: &str) -> ChannelError {
    ChannelError::transport(channel, operation, "unknown channel")
}

impl Transport for InMemoryTransport {
    fn channel_kind(&self, channel: &str) -> ChannelKind {
        self.kinds
            .get(channel)
            .map(|kind| *kind)
            .unwrap_or(ChannelKind::Log)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn list_shards<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let channels = self.channels.read().await;
            channels
                .get(channel)
                .map(|c| c.shard_ids.clone())
                .ok_or_else(|| unknown_channel(channel, "list_shards"))
        })
    }

    fn poll<'a>(
        &'a self,
        channel: &'a str,
        from: &'a ShardPosition,
        max_records: usize,
    ) -> BoxFuture<'a, PollResponse> {
        Box::pin(async move {
            let mut channels = self.channels.write().await;
            let ch = channels
                .get_mut(channel)
                .ok_or_else(|| unknown_channel(channel, "poll"))?;
            let log = ch.shards.get_mut(from.shard()).ok_or_else(|| {
                ChannelError::transport(channel, "poll", format!("unknown shard '{}'", from.shard()))
            })?;

            let response = match log {
                ShardLog::Log(records) => {
                    let start = match from.token() {
                        None => 0,
                        Some(token) => token.parse::<usize>().map(|t| t + 1).map_err(|_| {
                            ChannelError::transport(
                                channel,
                                "poll",
                                format!("invalid sequence token '{}'", token),
                            )
                        })?,
                    };
                    let start = start.min(records.len());
                    let end = start.saturating_add(max_records).min(records.len());
                    PollResponse {
                        records: records[start..end].to_vec(),
                        behind_latest: behind_latest(records.get(end)),
                    }
                }
                ShardLog::Queue { pending, .. } => {
                    let take = max_records.min(pending.len());
                    let batch: Vec<TransportRecord> = pending.drain(..take).collect();
                    PollResponse {
                        records: batch,
                        behind_latest: behind_latest(pending.front()),
                    }
                }
            };

            debug!(
                channel,
                shard = from.shard(),
                records = response.records.len(),
                "Polled in-memory shard"
            );
            Ok(response)
        })
    }

    fn put_batch<'a>(
        &'a self,
        channel: &'a str,
        records: Vec<OutgoingRecord>,
    ) -> BoxFuture<'a, Vec<RecordOutcome>> {
        Box::pin(async move {
            if records.len() > self.max_batch_size {
                return Err(ChannelError::transport(
                    channel,
                    "put_batch",
                    format!(
                        "batch of {} exceeds maximum of {}",
                        records.len(),
                        self.max_batch_size
                    ),
                ));
            }
            let mut channels = self.channels.write().await;
            let ch = channels
                .get_mut(channel)
                .ok_or_else(|| unknown_channel(channel, "put_batch"))?;
            let now = Utc::now();

            let outcomes = records
                .into_iter()
                .map(|record| {
                    if record.data.len() > MAX_RECORD_SIZE {
                        return RecordOutcome::terminal(
                            "ValidationException",
                            format!("record of {} bytes exceeds {}", record.data.len(), MAX_RECORD_SIZE),
                        );
                    }
                    match ch.append(&record.key, record.data, now) {
                        Some(token) => RecordOutcome::accepted(Some(token)),
                        None => RecordOutcome::retryable("ShardUnavailable", "shard not found"),
                    }
                })
                .collect();
            Ok(outcomes)
        })
    }
}
