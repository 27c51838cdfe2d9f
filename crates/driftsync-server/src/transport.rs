//! Per-connection transport driver.
//!
//! Owns one inbound frame parser and one outbound byte queue. The driver is
//! sans-IO: the socket layer feeds it raw reads via [`Transport::ingest`]
//! and drains [`Transport::next_write`] into the socket. The empty-outbound
//! condition is the pump for outbound file transfers: when the queue runs
//! dry the server asks the protocol state machine for the next payload
//! chunk.

use std::collections::VecDeque;

use driftsync_proto::{
    CodecError, FrameEvent, FrameReader, Message, encode_frame, encode_message,
    encode_payload_chunk,
};

/// Framed byte stream between one socket and one protocol state machine.
#[derive(Debug, Default)]
pub struct Transport {
    reader: FrameReader,
    outbound: VecDeque<Vec<u8>>,
}

impl Transport {
    /// New driver with empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw socket bytes; returns the frame events they completed.
    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        self.reader.feed(bytes)
    }

    /// Encode and queue one message frame.
    ///
    /// Signatures are not produced by this node; the frame prefix is chosen
    /// from the message's payload flag alone.
    pub fn queue_message(&mut self, message: &Message) -> Result<(), CodecError> {
        let body = encode_message(message)?;
        let frame = encode_frame(&body, None, message.carries_payload())?;
        self.outbound.push_back(frame);
        Ok(())
    }

    /// Queue one payload chunk frame; empty data queues the terminator.
    pub fn queue_chunk(&mut self, data: &[u8]) {
        self.outbound.push_back(encode_payload_chunk(data));
    }

    /// Next buffer to write to the socket, in queue order.
    pub fn next_write(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    /// True when nothing is waiting to be written.
    pub fn is_drained(&self) -> bool {
        self.outbound.is_empty()
    }
}
