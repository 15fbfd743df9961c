//! Consumer that records what it was handed.

use channel_engine::consumer::Delivery;
use channel_engine::{BoxFuture, ChannelError, KeyPattern, Message, MessageConsumer};
use std::sync::Mutex;

/// One delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub key: String,
    pub shard: Option<String>,
    pub token: Option<String>,
    pub payload: Option<serde_json::Value>,
}

/// Records every message it accepts; optionally fails on one key.
pub struct RecordingConsumer {
    name: String,
    pattern: KeyPattern,
    fail_on: Option<(String, bool)>,
    delivered: Mutex<Vec<Delivered>>,
}

impl RecordingConsumer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: KeyPattern::any(),
            fail_on: None,
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn with_pattern(mut self, pattern: KeyPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Fail on `key` with a plain consumer error.
    pub fn failing_on(mut self, key: &str) -> Self {
        self.fail_on = Some((key.to_string(), false));
        self
    }

    /// Fail on `key` with a state repository error.
    pub fn repository_failing_on(mut self, key: &str) -> Self {
        self.fail_on = Some((key.to_string(), true));
        self
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.delivered().into_iter().map(|d| d.key).collect()
    }
}

impl MessageConsumer for RecordingConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    fn accept<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Delivery> {
        Box::pin(async move {
            if let Some((key, repository)) = &self.fail_on {
                if key == message.key() {
                    return Err(if *repository {
                        ChannelError::state_repository("recording", "store unavailable")
                    } else {
                        ChannelError::Internal(format!("refusing {}", key))
                    });
                }
            }

            let position = message.header().map(|h| h.shard_position.clone());
            self.delivered.lock().unwrap().push(Delivered {
                key: message.key().to_string(),
                shard: position.as_ref().map(|p| p.shard().to_string()),
                token: position.as_ref().and_then(|p| p.token().map(str::to_string)),
                payload: message.payload_as::<serde_json::Value>().and_then(|r| r.ok()),
            });
            Ok(Delivery::Delivered)
        })
    }
}
