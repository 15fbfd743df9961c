// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Messages and the record codec.
//!
//! A [`Message`] is a partition key, an optional header describing where it
//! was read from, and an optional payload. An absent payload is a
//! *tombstone*: the entity identified by the key has been deleted.
//!
//! # Wire Format
//!
//! Records cross the transport as a JSON envelope:
//!
//! ```text
//! {"key": "product-17", "payload": {"price": 42}}
//! {"key": "product-17", "payload": null}          ← tombstone
//! ```
//!
//! Envelopes may be zstd-compressed. Compressed records are detected by the
//! zstd magic bytes, so compressed and plain records can share a channel.

use crate::error::{ChannelError, Result};
use crate::position::ShardPosition;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;

/// Zstd frame magic bytes.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compression level used when publishing compressed envelopes.
const ZSTD_LEVEL: i32 = 3;

/// Where and when a consumed message was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub shard_position: ShardPosition,
    pub arrival_timestamp: DateTime<Utc>,
    /// How far the message trailed wall clock when it was read.
    pub duration_behind: Option<Duration>,
}

impl Header {
    /// Header for a record read now, with lag computed from its arrival.
    pub fn of(shard_position: ShardPosition, arrival_timestamp: DateTime<Utc>) -> Self {
        Self::observed_at(shard_position, arrival_timestamp, Utc::now())
    }

    /// Header for a record read at `now`.
    ///
    /// Arrival timestamps in the future (clock skew) yield zero lag.
    pub fn observed_at(
        shard_position: ShardPosition,
        arrival_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let duration_behind = Some((now - arrival_timestamp).to_std().unwrap_or(Duration::ZERO));
        Self {
            shard_position,
            arrival_timestamp,
            duration_behind,
        }
    }
}

/// A keyed message flowing through a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    key: String,
    header: Option<Header>,
    payload: Option<Vec<u8>>,
}

impl Message {
    /// Message with raw JSON payload bytes.
    pub fn new(key: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            header: None,
            payload,
        }
    }

    /// Deletion marker for `key`.
    pub fn tombstone(key: impl Into<String>) -> Self {
        Self::new(key, None)
    }

    /// Message carrying `value` serialized as JSON.
    pub fn json<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| ChannelError::Internal(format!("payload serialization: {}", e)))?;
        Ok(Self::new(key, Some(payload)))
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.header = Some(header);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// Decode the payload as `T`.
    ///
    /// Returns `None` for tombstones.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
        self.payload.as_deref().map(serde_json::from_slice)
    }

    pub fn duration_behind(&self) -> Option<Duration> {
        self.header.as_ref().and_then(|h| h.duration_behind)
    }

    pub fn arrival_timestamp(&self) -> Option<DateTime<Utc>> {
        self.header.as_ref().map(|h| h.arrival_timestamp)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    key: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

/// Encode a message into its wire envelope.
///
/// Fails if the payload bytes are not valid JSON.
pub fn encode_record(message: &Message, compress: bool) -> Result<Vec<u8>> {
    let payload = match message.payload() {
        Some(bytes) => Some(serde_json::from_slice::<serde_json::Value>(bytes).map_err(|e| {
            ChannelError::Internal(format!(
                "payload for key '{}' is not valid JSON: {}",
                message.key(),
                e
            ))
        })?),
        None => None,
    };
    let envelope = Envelope {
        key: message.key.clone(),
        payload,
    };
    let json = serde_json::to_vec(&envelope)
        .map_err(|e| ChannelError::Internal(format!("envelope serialization: {}", e)))?;

    if compress {
        zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
            .map_err(|e| ChannelError::Internal(format!("zstd encode: {}", e)))
    } else {
        Ok(json)
    }
}

/// Decode a wire envelope into a header-less message.
///
/// Errors are reported against `channel` and `shard` so the failing shard
/// can be identified from the error alone.
pub fn decode_record(channel: &str, shard: &str, raw: &[u8]) -> Result<Message> {
    let data = maybe_decompress(raw)
        .map_err(|e| ChannelError::consumption(channel, shard, format!("zstd decode: {}", e)))?;
    let envelope: Envelope = serde_json::from_slice(&data)
        .map_err(|e| ChannelError::consumption(channel, shard, format!("invalid envelope: {}", e)))?;

    let payload = match envelope.payload {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => Some(serde_json::to_vec(&value).map_err(|e| {
            ChannelError::consumption(channel, shard, format!("payload re-encode: {}", e))
        })?),
    };
    Ok(Message::new(envelope.key, payload))
}

/// Decompress zstd data if it carries the zstd magic, otherwise copy it.
pub fn maybe_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)?;
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_tombstone() {
        let message = Message::tombstone("k1");
        assert!(message.is_tombstone());
        assert!(message.payload_as::<serde_json::Value>().is_none());
    }

    #[test]
    fn test_payload_as() {
        let message = Message::json("k1", &json!({"a": 1})).unwrap();
        assert!(!message.is_tombstone());
        let value: serde_json::Value = message.payload_as().unwrap().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_header_duration_behind() {
        let arrival = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 12).unwrap();
        let header = Header::observed_at(ShardPosition::at("s0", "1"), arrival, now);
        assert_eq!(header.duration_behind, Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_header_future_arrival_is_zero_lag() {
        let arrival = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let header = Header::observed_at(ShardPosition::at("s0", "1"), arrival, now);
        assert_eq!(header.duration_behind, Some(Duration::ZERO));
    }

    #[test]
    fn test_codec_plain_and_compressed() {
        let message = Message::json("k1", &json!({"b": 2})).unwrap();
        for compress in [false, true] {
            let raw = encode_record(&message, compress).unwrap();
            assert_eq!(compress, raw[..4] == ZSTD_MAGIC);
            let decoded = decode_record("c", "s0", &raw).unwrap();
            assert_eq!(decoded.key(), "k1");
            let value: serde_json::Value = decoded.payload_as().unwrap().unwrap();
            assert_eq!(value, json!({"b": 2}));
        }
    }

    #[test]
    fn test_codec_tombstone() {
        let raw = encode_record(&Message::tombstone("gone"), false).unwrap();
        assert_eq!(raw, br#"{"key":"gone","payload":null}"#.to_vec());
        let decoded = decode_record("c", "s0", &raw).unwrap();
        assert!(decoded.is_tombstone());
    }

    #[test]
    fn test_decode_missing_payload_is_tombstone() {
        let decoded = decode_record("c", "s0", br#"{"key":"k"}"#).unwrap();
        assert!(decoded.is_tombstone());
    }

    #[test]
    fn test_decode_garbage_is_consumption_error() {
        let err = decode_record("orders", "s3", b"not json").unwrap_err();
        assert!(matches!(err, ChannelError::Consumption { ref shard, .. } if shard == "s3"));
    }

    #[test]
    fn test_encode_rejects_non_json_payload() {
        let message = Message::new("k", Some(b"\xff\xfe".to_vec()));
        assert!(encode_record(&message, false).is_err());
    }

    #[test]
    fn test_maybe_decompress_short_data() {
        assert_eq!(maybe_decompress(&[0x28, 0xB5]).unwrap(), vec![0x28, 0xB5]);
    }

    #[test]
    fn test_maybe_decompress_fake_magic() {
        let mut data = ZSTD_MAGIC.to_vec();
        data.extend_from_slice(b"garbage");
        assert!(maybe_decompress(&data).is_err());
    }

    #[test]
    fn test_content_hash() {
        let hash = content_hash(b"hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
