//! Fuzz target for pack decompression.
//!
//! This tests that `decompress_pack` never panics on arbitrary input.

#![no_main]

use journal_sync::codec::decompress_pack;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Just call decompress_pack - it should never panic
    let _ = decompress_pack(data);
});
