//! Error types for the share index and the protocol state machine.
//!
//! The split follows the recovery rules: [`ShareError`] covers local
//! database and filesystem faults, which are usually survivable for the
//! share as a whole; [`ProtocolError`] means a connection-level invariant
//! broke and the connection must be closed.

use driftsync_proto::CodecError;
use thiserror::Error;

use crate::protocol::State;

/// Errors from the share index: database, identity, and filesystem faults.
#[derive(Error, Debug)]
pub enum ShareError {
    /// Underlying SQLite error
    #[error("share database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Filesystem error outside the per-file recovery paths
    #[error("share I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The attach path does not exist or is not a directory
    #[error("share root {0} is not a directory")]
    NotADirectory(String),
}

/// Errors that are fatal for one connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A valid message arrived in a state that does not allow it
    #[error("unexpected {kind} message in state {state:?}")]
    Unexpected {
        /// State the connection was in
        state: State,
        /// Kind of the offending message
        kind: &'static str,
    },

    /// Message body could not be decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The referenced share is not attached on this node
    #[error("share {0} not found")]
    ShareNotFound(String),

    /// The handshake reply named a different share than we opened
    #[error("share id mismatch: started {started}, peer answered {answered}")]
    ShareIdMismatch {
        /// Share id we sent in `Start`
        started: String,
        /// Share id in the peer's `Go`
        answered: String,
    },

    /// Payload bytes arrived with no transfer in progress
    #[error("unexpected payload: no file transfer in progress")]
    UnexpectedPayload,

    /// `FileData` announced different content than the in-flight `Get`
    #[error("file data for {got} while waiting for {expected}")]
    WrongFileData {
        /// Checksum we requested
        expected: String,
        /// Checksum the peer announced
        got: String,
    },

    /// Share-level failure while handling a message
    #[error(transparent)]
    Share(#[from] ShareError),

    /// I/O failure on the file being transferred
    #[error("transfer I/O error: {0}")]
    Io(#[from] std::io::Error),
}
