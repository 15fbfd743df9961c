//! Fuzz target for position parsing and merge.
//!
//! Positions come back from snapshots written by other processes, so their
//! JSON is untrusted. Anything that parses must merge without moving a
//! shard back to the horizon.

#![no_main]

use channel_engine::ChannelPosition;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (older, newer) = data;

    let Ok(older) = serde_json::from_str::<ChannelPosition>(older) else {
        return;
    };
    let Ok(newer) = serde_json::from_str::<ChannelPosition>(newer) else {
        return;
    };

    let merged = older.merge(&newer);
    for position in older.iter().chain(newer.iter()) {
        if !position.is_horizon() {
            assert!(!merged.lookup(position.shard()).is_horizon());
        }
    }
});
