//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - A scripted transport for failure injection on poll and publish
//! - A recording consumer for dispatch assertions
//! - Message helpers

#![allow(dead_code)]

pub mod recording;
pub mod scripted;

pub use recording::*;
pub use scripted::*;

use channel_engine::Message;
use serde_json::Value;

/// A JSON message, panicking on encode failure.
pub fn json_message(key: &str, value: Value) -> Message {
    Message::json(key, &value).expect("serializable payload")
}
