//! Fuzz target for protocol negotiation messages
//!
//! Decoding arbitrary bytes must never panic, and every decoded message
//! must fit inside the input.

#![no_main]

use ferry_core::negotiate::{ProtocolId, decode_message};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Ok(Some((msg, used))) = decode_message(rest) {
        assert!(msg.len() < used && used <= rest.len());
        if let Ok(text) = std::str::from_utf8(msg) {
            let _ = ProtocolId::new(text.to_string());
        }
        rest = &rest[used..];
    }
});
