// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot artifacts.
//!
//! A [`Snapshot`] is the compacted state of a channel: the latest value of
//! every live key plus the [`ChannelPosition`] the state was built up to.
//! Consumers seed their state from it and resume from its position instead
//! of replaying the whole channel.
//!
//! # Body Format
//!
//! ```text
//! channel-snapshot/1 <sha256 of json, hex>\n
//! {"channel":"offers","position":{"shard-0":"41"},"created_at":"...","entries":{...}}
//! ```
//!
//! The whole body is optionally zstd-compressed. The checksum covers the
//! JSON exactly as written, so a body is verified without re-serializing.

pub mod store;

pub use store::{InMemoryObjectStore, LocalObjectStore, ObjectStore, SnapshotStore};

use crate::error::{ChannelError, Result};
use crate::message::{content_hash, maybe_decompress};
use crate::position::ChannelPosition;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Format tag on the first line of every snapshot body.
pub const SNAPSHOT_FORMAT: &str = "channel-snapshot/1";

const ZSTD_LEVEL: i32 = 3;

/// Compacted state of a channel at a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub channel: String,
    pub position: ChannelPosition,
    /// Aggregate lag when the snapshot was taken, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_behind_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub entries: BTreeMap<String, Value>,
}

/// Encoded body plus the checksum of its JSON.
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub bytes: Vec<u8>,
    pub checksum: String,
}

impl Snapshot {
    pub fn new(
        channel: impl Into<String>,
        position: ChannelPosition,
        entries: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            channel: channel.into(),
            position,
            duration_behind_ms: None,
            created_at: Utc::now(),
            entries,
        }
    }

    pub fn with_duration_behind(mut self, behind: Option<Duration>) -> Self {
        self.duration_behind_ms = behind.map(|d| d.as_millis() as u64);
        self
    }

    pub fn duration_behind(&self) -> Option<Duration> {
        self.duration_behind_ms.map(Duration::from_millis)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Typed value of `key`, if present.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<serde_json::Result<T>> {
        self.entries
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
    }

    pub fn encode(&self, compress: bool) -> Result<EncodedSnapshot> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ChannelError::Snapshot(format!("serialize: {}", e)))?;
        let checksum = content_hash(&json);

        let mut body = Vec::with_capacity(json.len() + SNAPSHOT_FORMAT.len() + 66);
        body.extend_from_slice(SNAPSHOT_FORMAT.as_bytes());
        body.push(b' ');
        body.extend_from_slice(checksum.as_bytes());
        body.push(b'\n');
        body.extend_from_slice(&json);

        let bytes = if compress {
            zstd::encode_all(body.as_slice(), ZSTD_LEVEL)
                .map_err(|e| ChannelError::Snapshot(format!("zstd encode: {}", e)))?
        } else {
            body
        };
        Ok(EncodedSnapshot { bytes, checksum })
    }

    /// Decode and verify a body produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Snapshot> {
        let body = maybe_decompress(bytes)
            .map_err(|e| ChannelError::Snapshot(format!("zstd decode: {}", e)))?;

        let newline = body
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| ChannelError::Snapshot("missing header line".into()))?;
        let header = std::str::from_utf8(&body[..newline])
            .map_err(|_| ChannelError::Snapshot("header is not UTF-8".into()))?;
        let json = &body[newline + 1..];

        let expected = match header.split_once(' ') {
            Some((SNAPSHOT_FORMAT, checksum)) => checksum,
            _ => {
                return Err(ChannelError::Snapshot(format!(
                    "unrecognized header '{}'",
                    header
                )))
            }
        };

        let actual = content_hash(json);
        if actual != expected {
            return Err(ChannelError::Snapshot(format!(
                "checksum mismatch: expected {}, got {}",
                expected, actual
            )));
        }

        serde_json::from_slice(json).map_err(|e| ChannelError::Snapshot(format!("deserialize: {}", e)))
    }
}
