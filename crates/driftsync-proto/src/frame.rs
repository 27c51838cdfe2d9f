//! Byte framing: length-prefixed messages with optional signature and payload.
//!
//! Every frame starts with a one-byte prefix that selects its shape:
//!
//! ```text
//! 'm'  message
//! '!'  message + payload
//! 's'  message + signature
//! '$'  message + signature + payload
//! ```
//!
//! followed by a 4-byte big-endian length, a literal `:`, and that many bytes
//! of encoded message. Signed shapes append a second length-prefixed section
//! for the signature. Payload-bearing shapes are followed by a sequence of
//! length-prefixed chunks terminated by a zero-length chunk.
//!
//! [`FrameReader`] is an incremental parser: it accepts byte slices of any
//! size and yields [`FrameEvent`]s once enough bytes have accumulated. Bytes
//! that cannot be interpreted under the current shape produce a
//! [`FrameEvent::Garbage`] event rather than an error; the connection owner
//! is expected to reset the connection.

use bytes::{Buf, Bytes, BytesMut};

use crate::errors::{CodecError, Result};

/// Maximum size of a single encoded message (16 MiB).
///
/// The 4-byte length prefix could express more, but larger messages are
/// rejected on both sides to bound per-connection memory.
pub const MAX_MESSAGE_SIZE: usize = 1 << 24;

/// Maximum accepted signature size.
///
/// The wire format leaves signature length unbounded; this is buffer policy.
const MAX_SIGNATURE_SIZE: usize = 1 << 24;

/// Length prefix (4 bytes) plus the `:` separator.
const SECTION_HEADER_LEN: usize = 5;

/// Events produced by [`FrameReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete message section was framed.
    Message {
        /// Encoded message bytes (not yet decoded)
        body: Bytes,
        /// Detached signature, when the frame shape carried one
        signature: Option<Bytes>,
        /// Whether payload chunks follow this message
        has_payload: bool,
    },

    /// Raw payload bytes belonging to the most recent payload-bearing
    /// message. A single wire chunk may surface as several events when it
    /// arrives split across reads.
    PayloadChunk(Bytes),

    /// The zero-length terminator chunk was seen; the payload is complete.
    PayloadEnd,

    /// Bytes that cannot be parsed under the current shape.
    ///
    /// Carries whatever was buffered for diagnostics. The reader does not
    /// attempt resynchronization; the owner should drop the connection.
    Garbage(Bytes),
}

/// Prefix byte → (has signature, has payload). `None` for unknown prefixes.
fn shape_of(prefix: u8) -> Option<(bool, bool)> {
    match prefix {
        b'm' => Some((false, false)),
        b'!' => Some((false, true)),
        b's' => Some((true, false)),
        b'$' => Some((true, true)),
        _ => None,
    }
}

/// (has payload, has signature) → prefix byte.
fn prefix_for(has_payload: bool, has_signature: bool) -> u8 {
    match (has_payload, has_signature) {
        (false, false) => b'm',
        (true, false) => b'!',
        (false, true) => b's',
        (true, true) => b'$',
    }
}

/// Encode one message frame.
///
/// The prefix is derived from `has_payload` and the presence of `signature`.
/// Payload chunks are emitted separately via [`encode_payload_chunk`].
pub fn encode_frame(body: &[u8], signature: Option<&[u8]>, has_payload: bool) -> Result<Vec<u8>> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge { size: body.len(), max: MAX_MESSAGE_SIZE });
    }

    let sig_len = signature.map_or(0, <[u8]>::len);
    let mut out = Vec::with_capacity(1 + SECTION_HEADER_LEN + body.len() + sig_len);

    out.push(prefix_for(has_payload, signature.is_some()));
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.push(b':');
    out.extend_from_slice(body);

    if let Some(sig) = signature {
        out.extend_from_slice(&(sig.len() as u32).to_be_bytes());
        out.push(b':');
        out.extend_from_slice(sig);
    }

    Ok(out)
}

/// Encode one payload chunk frame. An empty `data` produces the mandatory
/// zero-length terminator.
pub fn encode_payload_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECTION_HEADER_LEN + data.len());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.push(b':');
    out.extend_from_slice(data);
    out
}

/// Parser mode between events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Expecting a message frame (prefix + sections).
    Message,
    /// Expecting a payload chunk header.
    PayloadHeader,
    /// Inside a payload chunk with this many bytes outstanding.
    PayloadData(usize),
}

/// Incremental frame parser.
///
/// Feed inbound bytes with [`FrameReader::feed`]; each call returns every
/// event that became complete. The reader buffers at most one message frame
/// plus whatever payload bytes arrived in the current read; payload data is
/// handed out as it arrives rather than accumulated per chunk.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    mode: Mode,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096), mode: Mode::Message }
    }

    /// Append inbound bytes and return all events completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();
        while let Some(event) = self.poll() {
            events.push(event);
        }
        events
    }

    /// Emit a garbage event carrying everything buffered.
    fn garbage(&mut self) -> FrameEvent {
        self.mode = Mode::Message;
        FrameEvent::Garbage(self.buf.split().freeze())
    }

    /// Try to produce the next event from the buffer.
    fn poll(&mut self) -> Option<FrameEvent> {
        match self.mode {
            Mode::Message => self.poll_message(),
            Mode::PayloadHeader => self.poll_payload_header(),
            Mode::PayloadData(remaining) => self.poll_payload_data(remaining),
        }
    }

    fn poll_message(&mut self) -> Option<FrameEvent> {
        if self.buf.len() < 1 + SECTION_HEADER_LEN {
            // A prefix we will never accept can be rejected without waiting
            // for the rest of the header.
            if self.buf.first().is_some_and(|p| shape_of(*p).is_none()) {
                return Some(self.garbage());
            }
            return None;
        }

        let Some((has_signature, has_payload)) = shape_of(self.buf[0]) else {
            return Some(self.garbage());
        };

        let body_len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
            as usize;
        if body_len > MAX_MESSAGE_SIZE || self.buf[5] != b':' {
            return Some(self.garbage());
        }

        let body_end = 1 + SECTION_HEADER_LEN + body_len;
        if self.buf.len() < body_end {
            return None;
        }

        let mut sig_len = 0;
        if has_signature {
            if self.buf.len() < body_end + SECTION_HEADER_LEN {
                return None;
            }
            sig_len = u32::from_be_bytes([
                self.buf[body_end],
                self.buf[body_end + 1],
                self.buf[body_end + 2],
                self.buf[body_end + 3],
            ]) as usize;
            if sig_len > MAX_SIGNATURE_SIZE || self.buf[body_end + 4] != b':' {
                return Some(self.garbage());
            }
            if self.buf.len() < body_end + SECTION_HEADER_LEN + sig_len {
                return None;
            }
        }

        self.buf.advance(1 + SECTION_HEADER_LEN);
        let body = self.buf.split_to(body_len).freeze();

        let signature = if has_signature {
            self.buf.advance(SECTION_HEADER_LEN);
            Some(self.buf.split_to(sig_len).freeze())
        } else {
            None
        };

        if has_payload {
            self.mode = Mode::PayloadHeader;
        }

        Some(FrameEvent::Message { body, signature, has_payload })
    }

    fn poll_payload_header(&mut self) -> Option<FrameEvent> {
        if self.buf.len() < SECTION_HEADER_LEN {
            return None;
        }

        let chunk_len =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf[4] != b':' {
            return Some(self.garbage());
        }

        self.buf.advance(SECTION_HEADER_LEN);
        if chunk_len == 0 {
            self.mode = Mode::Message;
            return Some(FrameEvent::PayloadEnd);
        }

        self.mode = Mode::PayloadData(chunk_len);
        self.poll_payload_data(chunk_len)
    }

    fn poll_payload_data(&mut self, remaining: usize) -> Option<FrameEvent> {
        if self.buf.is_empty() {
            return None;
        }

        let take = self.buf.len().min(remaining);
        let chunk = self.buf.split_to(take).freeze();
        self.mode = if take == remaining {
            Mode::PayloadHeader
        } else {
            Mode::PayloadData(remaining - take)
        };
        Some(FrameEvent::PayloadChunk(chunk))
    }
}
