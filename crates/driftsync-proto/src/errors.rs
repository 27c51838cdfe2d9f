//! Error types for the wire layer.
//!
//! Frame garbage is deliberately NOT an error: unparseable bytes surface as a
//! [`crate::FrameEvent::Garbage`] event so the connection owner decides what
//! to do. Errors here cover the cases where bytes framed correctly but the
//! content cannot be encoded or decoded; the peer is misbehaving and the
//! connection should be closed.

use thiserror::Error;

/// Result alias for wire-layer operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors produced while encoding or decoding protocol messages.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Message body was not valid JSON or did not match the expected shape.
    #[error("message decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encoded message exceeds the 16 MiB frame limit.
    #[error("message too large: {size} bytes exceeds {max}")]
    MessageTooLarge {
        /// Actual encoded size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// A file record arrived with an empty `paths` array.
    ///
    /// The canonical path of a record is `paths[0]`; a record without paths
    /// cannot be applied to any manifest.
    #[error("file record has no paths")]
    EmptyPaths,

    /// Attempted to encode a message kind that has no wire form.
    ///
    /// `Unknown` exists only to carry undecodable inbound messages for
    /// diagnostics; it is never sent.
    #[error("message kind {0:?} cannot be encoded")]
    Unencodable(&'static str),
}
