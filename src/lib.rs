//! # Channel Engine
//!
//! Consumption, compaction and publishing for ordered, partitioned message
//! channels (logs and queues).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              channel-engine                               │
//! │                                                                           │
//! │  ┌───────────┐    ┌───────────────────┐    ┌──────────────────────────┐   │
//! │  │ Transport │───►│ ConsumptionEngine │───►│ MessageDispatcher        │   │
//! │  │ (shards)  │    │ (task per shard)  │    │ (typed / stateful)       │   │
//! │  └───────────┘    └───────────────────┘    └──────────────────────────┘   │
//! │        ▲                    │                           │                 │
//! │        │                    ▼                           ▼                 │
//! │  ┌─────────────┐   ┌──────────────────┐     ┌──────────────────────┐      │
//! │  │ Reliable    │   │ CompactionEngine │────►│ StateRepository      │      │
//! │  │ Publisher   │   │ (replay → snap)  │     │ (DashMap / SQLite)   │      │
//! │  └─────────────┘   └──────────────────┘     └──────────────────────┘      │
//! │                             │                                             │
//! │                             ▼                                             │
//! │                    ┌──────────────────┐                                   │
//! │                    │ SnapshotStore    │                                   │
//! │                    │ (object store)   │                                   │
//! │                    └──────────────────┘                                   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Monotonic checkpoints**: a shard's position only moves forward
//! 2. **At-least-once delivery**: positions advance after dispatch
//! 3. **Per-key linearizable merge**: `compute` never loses an update
//! 4. **All-or-nothing snapshots**: `latest` moves only after a full write
//!
//! ## Usage
//!
//! ```rust,no_run
//! use channel_engine::{ChannelContext, EngineConfig, MessageDispatcher, StopCondition};
//! use channel_engine::snapshot::InMemoryObjectStore;
//! use channel_engine::transport::InMemoryTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(InMemoryTransport::new());
//!     transport.create_log("offers", 4).await;
//!
//!     let context = ChannelContext::new(
//!         EngineConfig::default(),
//!         transport,
//!         Arc::new(InMemoryObjectStore::new()),
//!     )
//!     .expect("valid config");
//!
//!     let start = context.resume_position("offers").await.expect("snapshot readable");
//!     let engine = context.consumer("offers", MessageDispatcher::new());
//!     let position = engine
//!         .consume_until(start, StopCondition::end_of_channel())
//!         .await
//!         .expect("consumption failed");
//!     println!("caught up at {position}");
//! }
//! ```

pub mod compaction;
pub mod config;
pub mod consumer;
pub mod context;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod message;
pub mod metrics;
pub mod notification;
pub mod position;
pub mod publisher;
pub mod resilience;
pub mod snapshot;
pub mod state;
pub mod stop;
pub mod transport;

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, error::Result<T>>;

// Re-exports for convenience
pub use compaction::{CompactionEngine, CompactionOutcome, MergeStrategy, ReplayMode, StagingHandoff};
pub use config::{CompactionConfig, ConsumerConfig, EngineConfig, PublisherConfig};
pub use consumer::{KeyPattern, MessageConsumer, MessageDispatcher, StatefulConsumer, TypedConsumer};
pub use context::{ChannelContext, LeaderElection, SingleNodeLeaderElection};
pub use engine::{ConsumeError, ConsumerState, ConsumptionEngine};
pub use error::{ChannelError, Result};
pub use message::{Header, Message};
pub use position::{ChannelDurationBehind, ChannelPosition, ShardPosition};
pub use publisher::{PublishReport, ReliableBatchPublisher};
pub use snapshot::{Snapshot, SnapshotStore};
pub use state::{InMemoryStateRepository, SqliteStateRepository, StateRepository};
pub use stop::StopCondition;
pub use transport::Transport;
