//! Fuzz test for size string parsing
//!
//! Tests that size parsing handles arbitrary inputs safely.

#![no_main]

use libfuzzer_sys::fuzz_target;

use cowstream_core::parse_size;

fuzz_target!(|data: &str| {
    // Should never panic, only return Ok/Err
    let _ = parse_size(data);

    for suffix in ["", "B", "K", "KB", "M", "MB", "G", "GB", "k", "m", "g", "b"] {
        let input = format!("{}{}", data.trim(), suffix);
        if let Ok(size) = parse_size(&input) {
            // A suffixed value is never smaller than the bare number
            if let Ok(bare) = data.trim().parse::<u64>() {
                assert!(size >= bare, "{} parsed to {}", input, size);
            }
        }
    }

    let _ = parse_size(&format!("  {}  ", data));
});
