//! Fuzz target for the gateway's TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Exercises `AppConfig::parse()` with arbitrary byte sequences to find
//! panics or hangs in the TOML parsing and validation pipeline.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // We don't care about the result, only that it doesn't panic.
        let _ = chatgate_config::AppConfig::parse(s);
    }
});
