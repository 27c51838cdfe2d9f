//! JSON message codec.
//!
//! Every message serializes as a JSON object with a `"type"` tag and
//! kind-specific fields, lowercase with underscores. `Start`/`Go` serialize
//! the share id under the historical key `id`.
//!
//! Unknown kinds do not fail the decoder: they come back as
//! [`Message::Unknown`] carrying the re-serialized body, so the state machine
//! can log exactly what the peer sent before closing on the violation. Truly
//! malformed input (bad JSON, missing fields, wrong types) is a
//! [`CodecError`] and the connection is closed upstream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    errors::{CodecError, Result},
    frame::MAX_MESSAGE_SIZE,
    message::{DEFAULT_PING_TIMEOUT, Handshake, Message, Update},
};

fn default_ping_timeout() -> u32 {
    DEFAULT_PING_TIMEOUT
}

/// Wire form of the message union.
///
/// Mirrors [`Message`] minus `Unknown`, which has no encodable form.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Wire {
    InternalSendStart {
        share_id: String,
    },
    Ping {
        #[serde(default = "default_ping_timeout")]
        timeout: u32,
    },
    Start(Handshake),
    Go(Handshake),
    CannotStart,
    GetUpdates {
        since: BTreeMap<String, u64>,
    },
    Update(Update),
    Get {
        checksum: String,
    },
    FileData {
        checksum: String,
    },
    NoSuchFile {
        checksum: String,
    },
    Identity {
        name: String,
        time: String,
    },
}

/// Kinds the decoder recognizes; everything else becomes `Unknown`.
const KNOWN_KINDS: &[&str] = &[
    "internal_send_start",
    "ping",
    "start",
    "go",
    "cannot_start",
    "get_updates",
    "update",
    "get",
    "file_data",
    "no_such_file",
    "identity",
];

/// Decode an encoded message body into a typed [`Message`].
pub fn decode_message(body: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(body)?;

    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    if !KNOWN_KINDS.contains(&kind) {
        return Ok(Message::Unknown { raw: value.to_string() });
    }

    let wire: Wire = serde_json::from_value(value)?;
    let message = match wire {
        Wire::InternalSendStart { share_id } => Message::InternalSendStart { share_id },
        Wire::Ping { timeout } => Message::Ping { timeout },
        Wire::Start(handshake) => Message::Start(handshake),
        Wire::Go(handshake) => Message::Go(handshake),
        Wire::CannotStart => Message::CannotStart,
        Wire::GetUpdates { since } => Message::GetUpdates { since },
        Wire::Update(update) => {
            if update.files.iter().any(|record| record.paths.is_empty()) {
                return Err(CodecError::EmptyPaths);
            }
            Message::Update(update)
        },
        Wire::Get { checksum } => Message::Get { checksum },
        Wire::FileData { checksum } => Message::FileData { checksum },
        Wire::NoSuchFile { checksum } => Message::NoSuchFile { checksum },
        Wire::Identity { name, time } => Message::Identity { name, time },
    };

    Ok(message)
}

/// Encode a typed [`Message`] into its JSON body.
///
/// The result is the frame's message section only; framing (prefix, lengths,
/// payload chunks) is applied by the transport.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let wire = match message {
        Message::InternalSendStart { share_id } => {
            Wire::InternalSendStart { share_id: share_id.clone() }
        },
        Message::Ping { timeout } => Wire::Ping { timeout: *timeout },
        Message::Start(handshake) => Wire::Start(handshake.clone()),
        Message::Go(handshake) => Wire::Go(handshake.clone()),
        Message::CannotStart => Wire::CannotStart,
        Message::GetUpdates { since } => Wire::GetUpdates { since: since.clone() },
        Message::Update(update) => Wire::Update(update.clone()),
        Message::Get { checksum } => Wire::Get { checksum: checksum.clone() },
        Message::FileData { checksum } => Wire::FileData { checksum: checksum.clone() },
        Message::NoSuchFile { checksum } => Wire::NoSuchFile { checksum: checksum.clone() },
        Message::Identity { name, time } => {
            Wire::Identity { name: name.clone(), time: time.clone() }
        },
        Message::Unknown { .. } => return Err(CodecError::Unencodable(message.kind())),
    };

    let body = serde_json::to_vec(&wire)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge { size: body.len(), max: MAX_MESSAGE_SIZE });
    }
    Ok(body)
}
