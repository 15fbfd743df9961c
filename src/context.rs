// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel context and leader election.
//!
//! A [`ChannelContext`] owns the collaborators shared by every channel of a
//! host (transport, snapshot store, notification sink, leader election) and
//! hands out consumption engines, publishers and the compaction engine built
//! from them. Hosts create one context at startup and pass it to whatever
//! needs channel access.
//!
//! ```rust,no_run
//! use channel_engine::config::EngineConfig;
//! use channel_engine::context::ChannelContext;
//! use channel_engine::snapshot::InMemoryObjectStore;
//! use channel_engine::transport::InMemoryTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> channel_engine::error::Result<()> {
//! let context = ChannelContext::new(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryTransport::new()),
//!     Arc::new(InMemoryObjectStore::new()),
//! )?;
//! let resume_from = context.resume_position("offers").await?;
//! # Ok(())
//! # }
//! ```

use crate::compaction::{CompactionEngine, CompactionOutcome, StagingHandoff};
use crate::config::EngineConfig;
use crate::consumer::MessageDispatcher;
use crate::engine::ConsumptionEngine;
use crate::error::Result;
use crate::interceptor::InterceptorChain;
use crate::notification::{LoggingSink, NotificationSink};
use crate::position::ChannelPosition;
use crate::publisher::ReliableBatchPublisher;
use crate::snapshot::{ObjectStore, SnapshotStore};
use crate::transport::Transport;
use crate::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Decides which node of a fleet runs a singleton task.
pub trait LeaderElection: Send + Sync + 'static {
    /// Whether this node currently holds `lock_name`.
    fn is_leader<'a>(&'a self, lock_name: &'a str) -> BoxFuture<'a, bool>;
}

/// A deployment of one node, which always leads.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleNodeLeaderElection;

impl LeaderElection for SingleNodeLeaderElection {
    fn is_leader<'a>(&'a self, _lock_name: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }
}

/// Run `task` only while holding `lock_name`; `Ok(None)` otherwise.
pub async fn run_if_leader<F, Fut, T>(
    election: &dyn LeaderElection,
    lock_name: &str,
    task: F,
) -> Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !election.is_leader(lock_name).await? {
        debug!(lock = lock_name, "Not leader, skipping task");
        return Ok(None);
    }
    task().await.map(Some)
}

/// Shared collaborators of every channel in a host.
pub struct ChannelContext {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    snapshots: SnapshotStore,
    sink: Arc<dyn NotificationSink>,
    leader_election: Arc<dyn LeaderElection>,
    interceptors: InterceptorChain,
    compaction: Arc<CompactionEngine>,
}

impl ChannelContext {
    /// Validate `config` and build a context with a logging sink and
    /// single-node leader election.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        config.validate()?;
        let snapshots = SnapshotStore::new(object_store, config.compaction.snapshot_prefix.clone())
            .with_compression(config.compaction.compress);

        let sink: Arc<dyn NotificationSink> = Arc::new(LoggingSink);
        let interceptors = InterceptorChain::new();
        let compaction = build_compaction(&config, &transport, &snapshots, &interceptors, &sink);

        Ok(Self {
            config,
            transport,
            snapshots,
            sink,
            leader_election: Arc::new(SingleNodeLeaderElection),
            interceptors,
            compaction,
        })
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self.rebuild_compaction();
        self
    }

    pub fn with_leader_election(mut self, election: Arc<dyn LeaderElection>) -> Self {
        self.leader_election = election;
        self
    }

    /// Interceptors applied by every engine and publisher of this context.
    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self.rebuild_compaction();
        self
    }

    fn rebuild_compaction(&mut self) {
        self.compaction = build_compaction(
            &self.config,
            &self.transport,
            &self.snapshots,
            &self.interceptors,
            &self.sink,
        );
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// A new consumption engine for `channel`.
    pub fn consumer(&self, channel: &str, dispatcher: MessageDispatcher) -> ConsumptionEngine {
        ConsumptionEngine::new(channel, Arc::clone(&self.transport), dispatcher)
            .with_config(self.config.consumer.clone())
            .with_interceptors(self.interceptors.clone())
            .with_notification_sink(Arc::clone(&self.sink))
    }

    pub fn publisher(&self) -> ReliableBatchPublisher {
        ReliableBatchPublisher::new(Arc::clone(&self.transport))
            .with_config(self.config.publisher.clone())
            .with_interceptors(self.interceptors.clone())
    }

    /// The compaction engine shared by every caller of this context.
    pub fn compaction(&self) -> Arc<CompactionEngine> {
        Arc::clone(&self.compaction)
    }

    /// Compact `channel` if this node leads its compaction lock.
    pub async fn compact_if_leader(
        &self,
        channel: &str,
        handoff: StagingHandoff,
    ) -> Result<Option<CompactionOutcome>> {
        self.compaction
            .compact_if_leader(self.leader_election.as_ref(), channel, handoff)
            .await
    }

    /// Position of the latest snapshot of `channel`, or the horizon.
    pub async fn resume_position(&self, channel: &str) -> Result<ChannelPosition> {
        Ok(self
            .snapshots
            .read_latest(channel)
            .await?
            .map(|snapshot| snapshot.position)
            .unwrap_or_default())
    }
}

fn build_compaction(
    config: &EngineConfig,
    transport: &Arc<dyn Transport>,
    snapshots: &SnapshotStore,
    interceptors: &InterceptorChain,
    sink: &Arc<dyn NotificationSink>,
) -> Arc<CompactionEngine> {
    Arc::new(
        CompactionEngine::new(Arc::clone(transport), snapshots.clone())
            .with_config(config.compaction.clone())
            .with_consumer_config(config.consumer.clone())
            .with_interceptors(interceptors.clone())
            .with_notification_sink(Arc::clone(sink)),
    )
}

impl std::fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelContext")
            .field("config", &self.config)
            .field("snapshots", &self.snapshots)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::message::Message;
    use crate::snapshot::InMemoryObjectStore;
    use crate::transport::InMemoryTransport;
    use serde_json::json;

    struct Follower;

    impl LeaderElection for Follower {
        fn is_leader<'a>(&'a self, _lock_name: &'a str) -> BoxFuture<'a, bool> {
            Box::pin(async { Ok(false) })
        }
    }

    fn context(transport: Arc<InMemoryTransport>) -> ChannelContext {
        ChannelContext::new(
            EngineConfig::for_testing(),
            transport,
            Arc::new(InMemoryObjectStore::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_if_leader() {
        let ran = run_if_leader(&SingleNodeLeaderElection, "job", || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(ran, Some(7));

        let skipped = run_if_leader(&Follower, "job", || async { Ok(7) }).await.unwrap();
        assert_eq!(skipped, None);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.consumer.poll_batch_size = 0;
        let result = ChannelContext::new(
            config,
            Arc::new(InMemoryTransport::new()),
            Arc::new(InMemoryObjectStore::new()),
        );
        assert!(matches!(result, Err(ChannelError::Config(_))));
    }

    #[tokio::test]
    async fn test_publish_compact_resume() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.create_log("offers", 2).await;
        let context = context(transport);

        assert!(context.resume_position("offers").await.unwrap().is_empty());

        context
            .publisher()
            .publish(
                "offers",
                vec![
                    Message::json("p-1", &json!({"price": 10})).unwrap(),
                    Message::json("p-2", &json!({"price": 20})).unwrap(),
                ],
            )
            .await
            .unwrap();

        let outcome = context
            .compact_if_leader("offers", StagingHandoff::Discard)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.entries, 2);
        assert_eq!(context.resume_position("offers").await.unwrap(), outcome.position);
    }

    #[tokio::test]
    async fn test_follower_does_not_compact() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.create_log("offers", 1).await;
        let context = context(transport).with_leader_election(Arc::new(Follower));

        let outcome = context
            .compact_if_leader("offers", StagingHandoff::Discard)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(context.snapshots().read_latest("offers").await.unwrap().is_none());
    }
}
