// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot compaction.
//!
//! Rebuilds the current state of a channel by replaying it into a staging
//! repository, then publishes the result as a [`Snapshot`].
//!
//! # Algorithm
//!
//! ```text
//! 1. staging = empty                       (ReplayMode::Full)
//!    staging = latest snapshot entries     (ReplayMode::Bootstrap)
//!    start   = horizon / snapshot position
//! 2. consume_until(start, lag_within(sync_threshold))
//!      update    → staging.compute(key, merge)
//!      tombstone → staging.remove(key)
//! 3. snapshot = {channel, final position, staging entries}
//! 4. write body, then repoint `latest`
//! 5. drop staging, or hand it to the caller
//! ```
//!
//! Any failure before step 4 aborts: nothing is published and the staging
//! repository is dropped.
//!
//! # Termination
//!
//! A shard stops once a poll comes back short of a full batch and the lag
//! its backend reports is within the threshold, so a backlog of fresh
//! records is always replayed to its end. A shard whose backend never
//! reports lag keeps replaying until it is stopped externally.
//!
//! # Exclusivity
//!
//! At most one compaction per channel runs in a process. Fleet-wide
//! exclusivity comes from a [`LeaderElection`] through
//! [`compact_if_leader`](CompactionEngine::compact_if_leader).

use crate::config::{CompactionConfig, ConsumerConfig};
use crate::consumer::{KeyPattern, MessageDispatcher, StatefulConsumer};
use crate::context::LeaderElection;
use crate::engine::ConsumptionEngine;
use crate::error::{ChannelError, Result};
use crate::interceptor::InterceptorChain;
use crate::metrics;
use crate::notification::{LoggingSink, NotificationSink};
use crate::position::ChannelPosition;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::state::{InMemoryStateRepository, StateRepository};
use crate::stop::StopCondition;
use crate::transport::Transport;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Where a compaction starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Empty state, from the horizon of every shard.
    #[default]
    Full,
    /// Entries and position of the latest snapshot; full replay if none.
    Bootstrap,
}

/// How an update is combined with the value already staged for its key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Last writer wins.
    #[default]
    Replace,
    /// Shallow object merge; fields of the update win. Non-objects replace.
    ObjectMerge,
}

impl MergeStrategy {
    pub fn apply(self, current: Option<Value>, update: Value) -> Value {
        match (self, current, update) {
            (Self::ObjectMerge, Some(Value::Object(mut base)), Value::Object(fields)) => {
                base.extend(fields);
                Value::Object(base)
            }
            (_, _, update) => update,
        }
    }
}

/// What happens to the staging repository after a successful compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingHandoff {
    Discard,
    /// Return it in [`CompactionOutcome::state`] as live materialized state.
    Keep,
}

/// A published snapshot.
pub struct CompactionOutcome {
    pub snapshot_key: String,
    pub position: ChannelPosition,
    pub entries: usize,
    /// The staging repository, when requested with [`StagingHandoff::Keep`].
    pub state: Option<Arc<InMemoryStateRepository<Value>>>,
}

impl std::fmt::Debug for CompactionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionOutcome")
            .field("snapshot_key", &self.snapshot_key)
            .field("position", &self.position)
            .field("entries", &self.entries)
            .field("state", &self.state.is_some())
            .finish()
    }
}

/// Removes the channel from the running set when dropped.
struct RunningGuard {
    running: Arc<DashSet<String>>,
    channel: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.channel);
    }
}

/// Replays channels into snapshots.
pub struct CompactionEngine {
    transport: Arc<dyn Transport>,
    snapshots: SnapshotStore,
    config: CompactionConfig,
    consumer_config: ConsumerConfig,
    interceptors: InterceptorChain,
    sink: Arc<dyn NotificationSink>,
    running: Arc<DashSet<String>>,
}

impl CompactionEngine {
    pub fn new(transport: Arc<dyn Transport>, snapshots: SnapshotStore) -> Self {
        Self {
            transport,
            snapshots,
            config: CompactionConfig::default(),
            consumer_config: ConsumerConfig::default(),
            interceptors: InterceptorChain::new(),
            sink: Arc::new(LoggingSink),
            running: Arc::new(DashSet::new()),
        }
    }

    pub fn with_config(mut self, config: CompactionConfig) -> Self {
        self.config = config;
        self
    }

    /// Polling settings of the replay.
    pub fn with_consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer_config = config;
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

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Whether a compaction of `channel` is running in this process.
    pub fn is_running(&self, channel: &str) -> bool {
        self.running.contains(channel)
    }

    fn acquire(&self, channel: &str) -> Result<RunningGuard> {
        if !self.running.insert(channel.to_string()) {
            return Err(ChannelError::CompactionInProgress(channel.to_string()));
        }
        Ok(RunningGuard {
            running: Arc::clone(&self.running),
            channel: channel.to_string(),
        })
    }

    /// Replay `channel` and publish a new snapshot.
    #[instrument(skip_all, fields(channel = %channel, mode = ?self.config.replay_mode))]
    pub async fn compact(&self, channel: &str, handoff: StagingHandoff) -> Result<CompactionOutcome> {
        let _guard = self.acquire(channel)?;
        let start = Instant::now();

        match self.run(channel, handoff).await {
            Ok(outcome) => {
                metrics::record_compaction(channel, true, outcome.entries, start.elapsed());
                info!(
                    key = %outcome.snapshot_key,
                    entries = outcome.entries,
                    position = %outcome.position,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Compaction complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                metrics::record_compaction(channel, false, 0, start.elapsed());
                warn!(error = %e, "Compaction aborted, nothing published");
                Err(e)
            }
        }
    }

    /// Compact only if this node holds the channel's compaction lock.
    ///
    /// Returns `Ok(None)` when another node is leader.
    pub async fn compact_if_leader(
        &self,
        election: &dyn LeaderElection,
        channel: &str,
        handoff: StagingHandoff,
    ) -> Result<Option<CompactionOutcome>> {
        let lock = format!("compaction:{}", channel);
        if !election.is_leader(&lock).await? {
            info!(channel, lock = %lock, "Not leader, skipping compaction");
            return Ok(None);
        }
        self.compact(channel, handoff).await.map(Some)
    }

    async fn run(&self, channel: &str, handoff: StagingHandoff) -> Result<CompactionOutcome> {
        let aborted = |message: String| ChannelError::CompactionAborted {
            channel: channel.to_string(),
            message,
        };

        let staging = Arc::new(InMemoryStateRepository::<Value>::new(format!(
            "compaction:{}",
            channel
        )));
        let start_position = self
            .seed(channel, &staging)
            .await
            .map_err(|e| aborted(format!("seeding from snapshot: {}", e)))?;

        let strategy = self.config.merge_strategy;
        let repository: Arc<dyn StateRepository<Value>> = staging.clone();
        let consumer = StatefulConsumer::new(KeyPattern::any(), repository).with_merge(
            move |_: &str, current: Option<Value>, update: Value| strategy.apply(current, update),
        );

        let engine = ConsumptionEngine::new(
            channel,
            Arc::clone(&self.transport),
            MessageDispatcher::new().with(Arc::new(consumer)),
        )
        .with_config(self.consumer_config.clone())
        .with_interceptors(self.interceptors.clone())
        .with_notification_sink(Arc::clone(&self.sink));

        let threshold = self.config.sync_threshold_duration();
        let position = engine
            .consume_until(start_position, StopCondition::lag_within(threshold))
            .await
            .map_err(|e| {
                let (position, source) = e.into_parts();
                aborted(format!("replay failed at {}: {}", position, source))
            })?;

        let entries: BTreeMap<String, Value> = staging
            .entries()
            .await
            .map_err(|e| aborted(e.to_string()))?
            .into_iter()
            .collect();
        let snapshot = Snapshot::new(channel, position.clone(), entries)
            .with_duration_behind(engine.duration_behind().duration_behind());

        let snapshot_key = self
            .snapshots
            .write(&snapshot)
            .await
            .map_err(|e| aborted(format!("publishing snapshot: {}", e)))?;

        Ok(CompactionOutcome {
            snapshot_key,
            position,
            entries: snapshot.len(),
            state: match handoff {
                StagingHandoff::Keep => Some(staging),
                StagingHandoff::Discard => None,
            },
        })
    }

    /// Fill `staging` according to the replay mode and return where to start.
    async fn seed(
        &self,
        channel: &str,
        staging: &InMemoryStateRepository<Value>,
    ) -> Result<ChannelPosition> {
        if self.config.replay_mode == ReplayMode::Full {
            return Ok(ChannelPosition::new());
        }

        let Some(snapshot) = self.snapshots.read_latest(channel).await? else {
            info!(channel, "No previous snapshot, replaying from the horizon");
            return Ok(ChannelPosition::new());
        };

        info!(
            channel,
            entries = snapshot.len(),
            position = %snapshot.position,
            "Bootstrapping from previous snapshot"
        );
        for (key, value) in snapshot.entries {
            staging.put(&key, value).await?;
        }
        Ok(snapshot.position)
    }
}

impl std::fmt::Debug for CompactionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionEngine")
            .field("config", &self.config)
            .field("snapshots", &self.snapshots)
            .finish()
    }
}
