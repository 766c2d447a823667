//! The frame decoder must never panic on arbitrary input, whole or split.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_proto::FrameDecoder;

fuzz_target!(|data: &[u8]| {
    // Feed the whole input at once.
    let mut decoder = FrameDecoder::new();
    decoder.push(data);
    while let Ok(Some(_)) = decoder.next_frame() {}

    // Feed the same input byte by byte; buffered state must stay coherent.
    let mut decoder = FrameDecoder::new();
    for byte in data {
        decoder.push(std::slice::from_ref(byte));
        while let Ok(Some(_)) = decoder.next_frame() {}
    }
});
