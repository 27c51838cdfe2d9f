//! Wire protocol for driftsync: byte framing and the typed message codec.
//!
//! Two layers live here, both free of I/O:
//!
//! - [`frame`]: length-prefixed frames that demultiplex encoded messages,
//!   optional signatures, and streamed payload chunks from one byte stream.
//! - [`codec`] / [`message`]: the closed set of typed protocol messages and
//!   their JSON encoding.
//!
//! The frame layer never inspects message bytes and the codec never sees
//! framing; the per-connection transport owns the composition of the two.

pub mod codec;
pub mod errors;
pub mod frame;
pub mod message;

pub use codec::{decode_message, encode_message};
pub use errors::{CodecError, Result};
pub use frame::{
    FrameEvent, FrameReader, MAX_MESSAGE_SIZE, encode_frame, encode_payload_chunk,
};
pub use message::{FileRecord, Handshake, Message, Update};
