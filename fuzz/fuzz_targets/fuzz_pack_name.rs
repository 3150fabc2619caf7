//! Fuzz target for pack name parsing and ordering.
//!
//! This tests that pack name comparison never panics on arbitrary input
//! and stays antisymmetric.

#![no_main]

use journal_sync::object_store::{compare_pack_names, is_pack_name, parse_pack_timestamp};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_pack_names(a, b);
    let ba = compare_pack_names(b, a);
    assert_eq!(ab, ba.reverse());
    assert_eq!(compare_pack_names(a, a), std::cmp::Ordering::Equal);

    // Parsing must agree with classification
    if is_pack_name(a) {
        assert!(parse_pack_timestamp(a).is_some());
    }
});
