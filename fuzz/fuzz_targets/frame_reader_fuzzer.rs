//! Fuzz target for the incremental frame reader.
//!
//! Feeds arbitrary bytes in arbitrary chunkings. The reader must never
//! panic: malformed input surfaces as a Garbage event, never an abort.

#![no_main]

use driftsync_proto::FrameReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (Vec<Vec<u8>>, Vec<u8>)| {
    let (chunks, tail) = input;

    let mut reader = FrameReader::new();
    for chunk in &chunks {
        let _ = reader.feed(chunk);
    }
    let _ = reader.feed(&tail);

    // Same bytes in one feed must also be handled.
    let mut whole = FrameReader::new();
    let joined: Vec<u8> =
        chunks.into_iter().flatten().chain(tail.into_iter()).collect();
    let _ = whole.feed(&joined);
});
