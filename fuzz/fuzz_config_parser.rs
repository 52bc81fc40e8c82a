//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary input through `GatewayConfig::parse()`, which covers TOML
//! decoding, listen-address parsing and validation.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = berth_config::GatewayConfig::parse(s) {
            // A config that validates must also yield its listen addresses.
            assert!(config.listen_addrs().is_ok());
        }
    }
});
