//! Fuzz target for multiplexer and length-prefixed frame decoding
//!
//! Both decoders must return a frame, "need more", or an error for any
//! input, and never report consuming more than they were given.

#![no_main]

use ferry_core::framed::FrameDecoder;
use ferry_core::mux::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Ok(Some((frame, used))) = Frame::decode(rest, 64 * 1024) {
        assert!(used > 0 && used <= rest.len());
        assert!(frame.payload.len() <= 64 * 1024);
        rest = &rest[used..];
    }

    let mut decoder = FrameDecoder::new(4096);
    for piece in data.chunks(7) {
        decoder.push(piece);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => assert!(frame.len() <= 4096),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
