//! Fuzz target for the transport classifier.
//!
//! Run with: cargo +nightly fuzz run fuzz_classify
//!
//! The input is split into path, query and body on the first two NUL bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parts = data.splitn(3, |b| *b == 0);
    let path = parts.next().map(String::from_utf8_lossy).unwrap_or_default();
    let query = parts.next().map(String::from_utf8_lossy).unwrap_or_default();
    let body = parts.next().unwrap_or_default();

    let result = berth_core::classify(&path, &query, body);
    if !berth_core::classify::needs_body(&path) {
        // Only exec start reads the body, so nothing else can fail.
        assert!(result.is_ok());
    }
});
