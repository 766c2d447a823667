//! Envelope decoding must never panic, and anything it accepts must
//! re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_proto::{Message, message};

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = Message::deserialize(data, "fuzz") {
        let _ = msg.serialize();
    }
    if let Ok(batch) = message::deserialize_messages(data) {
        let _ = message::serialize_messages(&batch);
    }
});
