//! Fuzz target for the record envelope decoder.
//!
//! This tests that `decode_record` never panics on arbitrary input, and that
//! anything it accepts encodes back to an envelope it accepts again.

#![no_main]

use channel_engine::message::{decode_record, encode_record, maybe_decompress};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);

    if let Ok(message) = decode_record("fuzz", "shard-0", data) {
        let raw = encode_record(&message, false).expect("decoded payloads are valid JSON");
        let again = decode_record("fuzz", "shard-0", &raw).expect("re-encoded record decodes");
        assert_eq!(again.key(), message.key());
        assert_eq!(again.is_tombstone(), message.is_tombstone());
    }
});
