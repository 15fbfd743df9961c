// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered message interceptors.
//!
//! The consumption engine runs the chain on every decoded message before
//! dispatch; the publisher runs it on every outgoing message before encoding.
//! An interceptor returning `None` drops the message. On the receive side a
//! dropped message still advances the shard position.

use crate::message::Message;
use std::sync::Arc;

/// A transform applied to messages entering or leaving the engine.
pub trait MessageInterceptor: Send + Sync {
    fn intercept(&self, message: Message) -> Option<Message>;
}

impl<F> MessageInterceptor for F
where
    F: Fn(Message) -> Option<Message> + Send + Sync,
{
    fn intercept(&self, message: Message) -> Option<Message> {
        self(message)
    }
}

/// Explicitly ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; it runs after all previously added ones.
    pub fn with(mut self, interceptor: impl MessageInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Run every interceptor in order, stopping at the first drop.
    pub fn apply(&self, message: Message) -> Option<Message> {
        self.interceptors
            .iter()
            .try_fold(message, |message, interceptor| interceptor.intercept(message))
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_chain_passes_through() {
        let chain = InterceptorChain::new();
        let message = Message::json("k", &json!(1)).unwrap();
        assert_eq!(chain.apply(message.clone()), Some(message));
    }

    #[test]
    fn test_chain_runs_in_order() {
        let chain = InterceptorChain::new()
            .with(|m: Message| Some(Message::new(format!("{}-a", m.key()), m.payload().map(<[u8]>::to_vec))))
            .with(|m: Message| Some(Message::new(format!("{}-b", m.key()), m.payload().map(<[u8]>::to_vec))));
        let out = chain.apply(Message::tombstone("k")).unwrap();
        assert_eq!(out.key(), "k-a-b");
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_drop_short_circuits() {
        let chain = InterceptorChain::new()
            .with(|m: Message| if m.key().starts_with("internal.") { None } else { Some(m) })
            .with(|_: Message| -> Option<Message> { panic!("must not run after a drop") });
        assert!(chain.apply(Message::tombstone("internal.heartbeat")).is_none());
    }
}
