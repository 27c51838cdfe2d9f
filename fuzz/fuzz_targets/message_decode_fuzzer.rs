//! Fuzz target for the JSON message codec.
//!
//! Decoding arbitrary bytes must only ever return a typed message, an
//! `Unknown` carrier, or a `CodecError`, and never panic. Anything that
//! decodes must re-encode (except `Unknown`, which has no wire form).

#![no_main]

use driftsync_proto::{Message, decode_message, encode_message};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = decode_message(data) {
        match &message {
            Message::Unknown { .. } => {},
            _ => {
                let body = encode_message(&message).expect("decoded message must re-encode");
                let again = decode_message(&body).expect("re-encoded message must decode");
                assert_eq!(message, again);
            },
        }
    }
});
