//! Fuzz target for the shepherd wire-protocol decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_protocol_decode
//!
//! The control channel feeds every line read off the TCP socket through
//! `protocol::decode`, so the decoder must never panic on hostile input.
//! Frames that survive decoding are re-encoded to make sure encode can
//! handle any value decode produces.

#![no_main]

use libfuzzer_sys::fuzz_target;
use merino_core::protocol::{self, SheepMessage, ShepherdMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(msg) = protocol::decode::<ShepherdMessage>(line) {
            let _ = protocol::encode(&msg);
        }
        if let Ok(msg) = protocol::decode::<SheepMessage>(line) {
            let _ = protocol::encode(&msg);
        }
    }
});
