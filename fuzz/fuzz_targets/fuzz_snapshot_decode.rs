//! Fuzz target for snapshot body decoding.
//!
//! This tests that `Snapshot::decode` never panics, whatever the header,
//! checksum or compression of the input.

#![no_main]

use channel_engine::Snapshot;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Should never panic
    let _ = Snapshot::decode(data);
});
