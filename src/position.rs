// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-shard consumption checkpoints and lag aggregation.
//!
//! A [`ChannelPosition`] maps every shard of a channel to the last sequence
//! token a consumer has processed. Tokens are opaque: they are only ever
//! handed back to the transport that produced them, and no ordering across
//! shards is assumed.
//!
//! # Horizon
//!
//! A shard that has not consumed anything yet sits at the *horizon*. Polling
//! from the horizon starts at the oldest retained record of the shard.
//!
//! ```text
//! shard-0: horizon ──poll──▶ "17" ──poll──▶ "42"
//! shard-1: "9"     ──poll──▶ "9"  (no new records)
//! ```
//!
//! # Merge
//!
//! [`ChannelPosition::merge`] combines two positions shard by shard. The
//! right-hand side is assumed more recent and wins, except that a horizon on
//! the right never overwrites a concrete token on the left, so merging can
//! never move a shard backwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Checkpoint of a single shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardPosition {
    shard: String,
    /// `None` is the horizon.
    token: Option<String>,
}

impl ShardPosition {
    /// Position of a shard that has not consumed any record.
    pub fn at_horizon(shard: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            token: None,
        }
    }

    /// Position of a shard after consuming the record with `token`.
    pub fn at(shard: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            token: Some(token.into()),
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Sequence token of the last consumed record, `None` at the horizon.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_horizon(&self) -> bool {
        self.token.is_none()
    }
}

impl fmt::Display for ShardPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(f, "{}@{}", self.shard, token),
            None => write!(f, "{}@horizon", self.shard),
        }
    }
}

/// Resume checkpoint for every shard of a channel.
///
/// Serializes as a map of shard id to token, with `null` for the horizon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Option<String>>",
    into = "BTreeMap<String, Option<String>>"
)]
pub struct ChannelPosition {
    shards: BTreeMap<String, ShardPosition>,
}

impl ChannelPosition {
    /// An empty position: every shard is implicitly at the horizon.
    pub fn new() -> Self {
        Self::default()
    }

    /// All given shards explicitly at the horizon.
    pub fn at_horizon<I, S>(shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        shards
            .into_iter()
            .map(ShardPosition::at_horizon)
            .collect()
    }

    /// Return a copy with `position` replacing the entry for its shard.
    pub fn with(mut self, position: ShardPosition) -> Self {
        self.shards.insert(position.shard.clone(), position);
        self
    }

    /// Record `position` for its shard in place.
    pub fn advance(&mut self, position: ShardPosition) {
        self.shards.insert(position.shard.clone(), position);
    }

    /// Position of `shard`, defaulting to the horizon when absent.
    pub fn lookup(&self, shard: &str) -> ShardPosition {
        self.shards
            .get(shard)
            .cloned()
            .unwrap_or_else(|| ShardPosition::at_horizon(shard))
    }

    /// Combine with a position assumed to be more recent.
    ///
    /// Shards present on only one side are kept as-is.
    pub fn merge(&self, newer: &ChannelPosition) -> ChannelPosition {
        let mut merged = self.shards.clone();
        for (shard, position) in &newer.shards {
            match merged.get(shard) {
                Some(existing) if position.is_horizon() && !existing.is_horizon() => {}
                _ => {
                    merged.insert(shard.clone(), position.clone());
                }
            }
        }
        ChannelPosition { shards: merged }
    }

    /// Shard ids with an explicit entry.
    pub fn shards(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardPosition> {
        self.shards.values()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl FromIterator<ShardPosition> for ChannelPosition {
    fn from_iter<T: IntoIterator<Item = ShardPosition>>(iter: T) -> Self {
        let shards = iter
            .into_iter()
            .map(|p| (p.shard.clone(), p))
            .collect();
        Self { shards }
    }
}

impl From<BTreeMap<String, Option<String>>> for ChannelPosition {
    fn from(map: BTreeMap<String, Option<String>>) -> Self {
        map.into_iter()
            .map(|(shard, token)| ShardPosition { shard, token })
            .collect()
    }
}

impl From<ChannelPosition> for BTreeMap<String, Option<String>> {
    fn from(position: ChannelPosition) -> Self {
        position
            .shards
            .into_iter()
            .map(|(shard, p)| (shard, p.token))
            .collect()
    }
}

impl fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, position) in self.shards.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", position)?;
        }
        write!(f, "]")
    }
}

/// How far each shard trails the head of its channel.
///
/// `None` for a shard means its lag is unknown, which sorts above every
/// known duration: a channel with any unknown shard is never in sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelDurationBehind {
    shards: BTreeMap<String, Option<Duration>>,
}

impl ChannelDurationBehind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every given shard with unknown lag.
    pub fn unknown<I, S>(shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shards: shards.into_iter().map(|s| (s.into(), None)).collect(),
        }
    }

    /// Set the lag of one shard, replacing any previous value.
    pub fn with(mut self, shard: impl Into<String>, behind: Option<Duration>) -> Self {
        self.shards.insert(shard.into(), behind);
        self
    }

    pub fn set(&mut self, shard: impl Into<String>, behind: Option<Duration>) {
        self.shards.insert(shard.into(), behind);
    }

    /// Lag of one shard. Absent shards are unknown.
    pub fn shard(&self, shard: &str) -> Option<Duration> {
        self.shards.get(shard).copied().flatten()
    }

    /// Per-shard maximum of both sides.
    pub fn merge(&self, other: &ChannelDurationBehind) -> ChannelDurationBehind {
        let mut merged = self.shards.clone();
        for (shard, behind) in &other.shards {
            let entry = merged.entry(shard.clone()).or_insert(*behind);
            *entry = max_lag(*entry, *behind);
        }
        ChannelDurationBehind { shards: merged }
    }

    /// Aggregate lag: the maximum over all shards.
    ///
    /// Unknown if the map is empty or any shard is unknown.
    pub fn duration_behind(&self) -> Option<Duration> {
        if self.shards.is_empty() {
            return None;
        }
        self.shards
            .values()
            .try_fold(Duration::ZERO, |acc, behind| behind.map(|b| acc.max(b)))
    }

    /// True when every known shard trails by at most `threshold`.
    pub fn is_in_sync(&self, threshold: Duration) -> bool {
        self.duration_behind().is_some_and(|d| d <= threshold)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Maximum of two lags where unknown dominates.
fn max_lag(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

impl fmt::Display for ChannelDurationBehind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration_behind() {
            Some(d) => write!(f, "{}", humantime::format_duration(d)),
            None => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_defaults_to_horizon() {
        let position = ChannelPosition::new().with(ShardPosition::at("s0", "5"));
        assert_eq!(position.lookup("s0").token(), Some("5"));
        assert!(position.lookup("s1").is_horizon());
        assert_eq!(position.lookup("s1").shard(), "s1");
    }

    #[test]
    fn test_merge_newer_wins() {
        let a = ChannelPosition::new()
            .with(ShardPosition::at("s0", "5"))
            .with(ShardPosition::at("s1", "3"));
        let b = ChannelPosition::new()
            .with(ShardPosition::at("s0", "9"))
            .with(ShardPosition::at("s2", "1"));

        let merged = a.merge(&b);
        assert_eq!(merged.lookup("s0").token(), Some("9"));
        assert_eq!(merged.lookup("s1").token(), Some("3"));
        assert_eq!(merged.lookup("s2").token(), Some("1"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_merge_horizon_never_regresses() {
        let a = ChannelPosition::new().with(ShardPosition::at("s0", "5"));
        let b = ChannelPosition::at_horizon(["s0", "s1"]);

        let merged = a.merge(&b);
        assert_eq!(merged.lookup("s0").token(), Some("5"));
        assert!(merged.lookup("s1").is_horizon());
    }

    #[test]
    fn test_serde_horizon_as_null() {
        let position = ChannelPosition::new()
            .with(ShardPosition::at("s0", "12"))
            .with(ShardPosition::at_horizon("s1"));
        let json = serde_json::to_string(&position).unwrap();
        assert_eq!(json, r#"{"s0":"12","s1":null}"#);

        let back: ChannelPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, position);
    }

    #[test]
    fn test_display() {
        let position = ChannelPosition::new()
            .with(ShardPosition::at("a", "1"))
            .with(ShardPosition::at_horizon("b"));
        assert_eq!(position.to_string(), "[a@1, b@horizon]");
    }

    #[test]
    fn test_duration_behind_is_max() {
        let lag = ChannelDurationBehind::new()
            .with("s0", Some(Duration::from_secs(3)))
            .with("s1", Some(Duration::from_secs(7)));
        assert_eq!(lag.duration_behind(), Some(Duration::from_secs(7)));
        assert!(lag.is_in_sync(Duration::from_secs(10)));
        assert!(!lag.is_in_sync(Duration::from_secs(5)));
    }

    #[test]
    fn test_unknown_shard_never_in_sync() {
        let lag = ChannelDurationBehind::unknown(["s0"]).with("s1", Some(Duration::ZERO));
        assert_eq!(lag.duration_behind(), None);
        assert!(!lag.is_in_sync(Duration::from_secs(3600)));
        assert_eq!(lag.to_string(), "unknown");
    }

    #[test]
    fn test_empty_is_unknown() {
        let lag = ChannelDurationBehind::new();
        assert_eq!(lag.duration_behind(), None);
        assert!(!lag.is_in_sync(Duration::MAX));
    }

    #[test]
    fn test_merge_takes_max_per_shard() {
        let a = ChannelDurationBehind::new()
            .with("s0", Some(Duration::from_secs(1)))
            .with("s1", Some(Duration::from_secs(9)));
        let b = ChannelDurationBehind::new()
            .with("s0", Some(Duration::from_secs(4)))
            .with("s1", None);

        let merged = a.merge(&b);
        assert_eq!(merged.shard("s0"), Some(Duration::from_secs(4)));
        assert_eq!(merged.shard("s1"), None);
    }
}
