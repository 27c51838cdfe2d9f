//! Typed protocol messages.
//!
//! The protocol speaks a closed set of message kinds; anything else decodes
//! to [`Message::Unknown`], which the state machine treats as a protocol
//! violation. Messages carry the union of fields the conversation needs:
//! handshake identity, manifest deltas, and content-addressed file requests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default keep-alive timeout carried by `Ping`, in seconds.
pub const DEFAULT_PING_TIMEOUT: u32 = 60;

/// Identity block exchanged in both handshake directions.
///
/// `Start` (initiator → listener) and `Go` (listener → initiator) carry the
/// same shape; only the direction differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Software identification string, e.g. `driftsync 0.1.0`
    pub software: String,
    /// Protocol revision number
    pub protocol: u32,
    /// Advertised feature strings
    pub features: Vec<String>,
    /// Share being opened (hex). Serialized as `id` on the wire.
    #[serde(rename = "id")]
    pub share_id: String,
    /// Access level granted to the peer (`read_write`, `read_only`,
    /// `untrusted`)
    pub access: String,
    /// Sender's per-share peer id (hex)
    pub peer: String,
    /// Human-readable node name
    pub name: String,
    /// Current time at the sender, ISO-8601 with trailing `Z`
    pub time: String,
}

/// One manifest entry as it travels inside an `Update`.
///
/// `paths` is plural on the wire; the canonical entry is `paths[0]`. The
/// vector clock rides along so the receiver can run descendant tests without
/// a second round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Lowercase hex SHA-256 of the content; empty when unknown or deleted
    pub checksum: String,
    /// Paths carrying this entry, canonical first
    pub paths: Vec<String>,
    /// Peer that last mutated the entry
    pub last_changed_by: String,
    /// Share revision at which the entry was last mutated
    pub last_changed_rev: u64,
    /// File mtime, ISO-8601 with trailing `Z`
    pub mtime: String,
    /// Content size in bytes
    pub size: u64,
    /// POSIX permission bits (low 12)
    pub mode: u32,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
    /// Per-peer causality counters; zero-valued keys omitted
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vclock: BTreeMap<String, u64>,
}

impl FileRecord {
    /// Canonical path of this record.
    ///
    /// Decoding guarantees `paths` is non-empty.
    pub fn path(&self) -> &str {
        self.paths.first().map_or("", String::as_str)
    }
}

/// A manifest delta, the reply to `GetUpdates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Sender's share revision when the delta was produced
    pub revision: u64,
    /// More `Update` messages follow when true
    #[serde(default)]
    pub partial: bool,
    /// The delta rows
    pub files: Vec<FileRecord>,
}

/// The closed union of protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Internal kick: make a fresh outbound connection emit `Start`.
    /// Never crosses the wire from a peer; the server injects it.
    InternalSendStart {
        /// Share to open the conversation for
        share_id: String,
    },

    /// Keep-alive. The receiver may close the connection after
    /// `2 × timeout` seconds of silence.
    Ping {
        /// Proposed keep-alive window in seconds
        timeout: u32,
    },

    /// Handshake offer (initiator → listener).
    Start(Handshake),

    /// Handshake acceptance (listener → initiator).
    Go(Handshake),

    /// Handshake refusal (listener → initiator).
    CannotStart,

    /// Request a manifest delta of rows newer than `since`.
    GetUpdates {
        /// peer_id → last seen revision from that peer
        since: BTreeMap<String, u64>,
    },

    /// Manifest delta.
    Update(Update),

    /// Request file content by checksum.
    Get {
        /// Lowercase hex SHA-256 of the wanted content
        checksum: String,
    },

    /// Announces that file content follows as payload chunks.
    FileData {
        /// Checksum of the content being streamed
        checksum: String,
    },

    /// Negative reply to `Get`.
    NoSuchFile {
        /// The checksum that could not be served
        checksum: String,
    },

    /// Legacy identity advertisement; ignored in CONNECTED.
    Identity {
        /// Peer's node name
        name: String,
        /// Peer's clock, ISO-8601 with trailing `Z`
        time: String,
    },

    /// A kind this implementation does not recognize.
    ///
    /// Carries the re-serialized JSON for diagnostic logging. Receiving one
    /// is a protocol violation.
    Unknown {
        /// Re-serialized message body
        raw: String,
    },
}

impl Message {
    /// Short kind name, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InternalSendStart { .. } => "internal_send_start",
            Self::Ping { .. } => "ping",
            Self::Start(_) => "start",
            Self::Go(_) => "go",
            Self::CannotStart => "cannot_start",
            Self::GetUpdates { .. } => "get_updates",
            Self::Update(_) => "update",
            Self::Get { .. } => "get",
            Self::FileData { .. } => "file_data",
            Self::NoSuchFile { .. } => "no_such_file",
            Self::Identity { .. } => "identity",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Whether this message is framed as payload-bearing (`!` prefix).
    pub fn carries_payload(&self) -> bool {
        matches!(self, Self::FileData { .. })
    }
}
