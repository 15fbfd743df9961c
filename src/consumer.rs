// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message consumers and the dispatcher that routes messages to them.
//!
//! Consumers are registered explicitly, in order, into a
//! [`MessageDispatcher`]. Each consumer declares a key pattern (a regex that
//! must match the whole key) and, for typed consumers, the payload type it
//! understands.
//!
//! # Error Policy
//!
//! | Consumer error | Effect |
//! |----------------|--------|
//! | State repository failure | Propagated; the shard halts |
//! | Anything else | Logged, counted, skipped; dispatch continues |
//!
//! Skipping keeps the poll loop alive (at-least-once for the channel), but a
//! consumer that failed on a message does not see it again unless the
//! channel is replayed.

use crate::error::{ChannelError, Result};
use crate::message::Message;
use crate::metrics;
use crate::state::{compute_fn, StateRepository};
use crate::BoxFuture;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Regex that must match an entire message key.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    /// `None` matches every key.
    regex: Option<Regex>,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| ChannelError::Config(format!("invalid key pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex: Some(regex),
        })
    }

    /// Matches every key.
    pub fn any() -> Self {
        Self {
            source: ".*".to_string(),
            regex: None,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.as_ref().map_or(true, |r| r.is_match(key))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Whether a consumer actually handled a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Payload was not of the consumer's type.
    Skipped,
}

/// Something that receives messages from a channel.
pub trait MessageConsumer: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    fn key_pattern(&self) -> &KeyPattern;

    fn accept<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Delivery>;
}

type TypedCallback<T> = dyn Fn(&Message, Option<T>) -> Result<()> + Send + Sync;

/// Consumer that decodes payloads as `T`.
///
/// Tombstones are delivered as `None`. Payloads that do not decode as `T`
/// are skipped.
pub struct TypedConsumer<T> {
    name: String,
    pattern: KeyPattern,
    callback: Box<TypedCallback<T>>,
}

impl<T: DeserializeOwned + Send + 'static> TypedConsumer<T> {
    pub fn new<F>(name: impl Into<String>, pattern: KeyPattern, callback: F) -> Self
    where
        F: Fn(&Message, Option<T>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            pattern,
            callback: Box::new(callback),
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> MessageConsumer for TypedConsumer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    fn accept<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Delivery> {
        let result = match message.payload_as::<T>() {
            None => (self.callback)(message, None).map(|_| Delivery::Delivered),
            Some(Ok(value)) => (self.callback)(message, Some(value)).map(|_| Delivery::Delivered),
            Some(Err(e)) => {
                debug!(consumer = %self.name, key = message.key(), error = %e, "Payload type mismatch, skipping");
                Ok(Delivery::Skipped)
            }
        };
        Box::pin(async move { result })
    }
}

type MergeFn<T> = dyn Fn(&str, Option<T>, T) -> T + Send + Sync;

/// Consumer that folds messages into a [`StateRepository`].
///
/// Updates go through `compute` with the configured merge function
/// (replace by default); tombstones remove the key.
pub struct StatefulConsumer<T> {
    name: String,
    pattern: KeyPattern,
    repository: Arc<dyn StateRepository<T>>,
    merge: Arc<MergeFn<T>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> StatefulConsumer<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(pattern: KeyPattern, repository: Arc<dyn StateRepository<T>>) -> Self {
        Self {
            name: format!("stateful:{}", repository.name()),
            pattern,
            repository,
            merge: Arc::new(|_: &str, _: Option<T>, update: T| update),
            _payload: PhantomData,
        }
    }

    /// Merge updates into the current value instead of replacing it.
    pub fn with_merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(&str, Option<T>, T) -> T + Send + Sync + 'static,
    {
        self.merge = Arc::new(merge);
        self
    }
}

impl<T> MessageConsumer for StatefulConsumer<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn key_pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    fn accept<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Delivery> {
        Box::pin(async move {
            let key = message.key();
            match message.payload_as::<T>() {
                None => {
                    self.repository.remove(key).await?;
                }
                Some(Ok(update)) => {
                    let merge = Arc::clone(&self.merge);
                    self.repository
                        .compute(
                            key,
                            compute_fn(move |key, current| Some(merge(key, current, update))),
                        )
                        .await?;
                }
                Some(Err(e)) => {
                    debug!(consumer = %self.name, key, error = %e, "Payload type mismatch, skipping");
                    return Ok(Delivery::Skipped);
                }
            }
            Ok(Delivery::Delivered)
        })
    }
}

/// Outcome of dispatching one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Ordered registry of consumers.
#[derive(Clone, Default)]
pub struct MessageDispatcher {
    consumers: Vec<Arc<dyn MessageConsumer>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer; it runs after all previously registered ones.
    pub fn register(&mut self, consumer: Arc<dyn MessageConsumer>) {
        self.consumers.push(consumer);
    }

    pub fn with(mut self, consumer: Arc<dyn MessageConsumer>) -> Self {
        self.register(consumer);
        self
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Deliver `message` to every matching consumer, in registration order.
    pub async fn dispatch(&self, channel: &str, message: &Message) -> Result<DispatchOutcome> {
        let mut outcome = DispatchOutcome::default();

        for consumer in &self.consumers {
            if !consumer.key_pattern().matches(message.key()) {
                continue;
            }
            match consumer.accept(message).await {
                Ok(Delivery::Delivered) => outcome.delivered += 1,
                Ok(Delivery::Skipped) => outcome.skipped += 1,
                Err(e) if e.is_state_repository() => return Err(e),
                Err(e) => {
                    warn!(
                        channel,
                        consumer = consumer.name(),
                        key = message.key(),
                        error = %e,
                        "Consumer failed, skipping message"
                    );
                    metrics::record_consumer_error(channel, consumer.name());
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.consumers.iter().map(|c| c.name()).collect();
        f.debug_struct("MessageDispatcher").field("consumers", &names).finish()
    }
}
